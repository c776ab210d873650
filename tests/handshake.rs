use std::time::Duration;

use color_eyre::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vesper_bridge::{error::Error, handshake};

mod common;

/// A one-connection server that runs `script` against the raw socket.
async fn raw_server<F, Fut>(script: F) -> Result<(u16, JoinHandle<Result<()>>)>
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        script(stream).await
    });

    Ok((port, handle))
}

async fn read_line(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    Ok(String::from_utf8(line)?)
}

#[tokio::test]
async fn login_succeeds_and_returns_overread_bytes() -> Result<()> {
    let (port, server) = raw_server(|mut stream| async move {
        stream.write_all(b"VESPER PPP 1\r\nLOGIN:\r\n").await?;
        let username = read_line(&mut stream).await?;
        assert_eq!(username, "alice");

        stream.write_all(b"PASSWORD:\r\n").await?;
        let password = read_line(&mut stream).await?;
        assert_eq!(password, "hunter2");

        // Payload right on the heels of the verdict.
        stream.write_all(b"OK\r\nabc").await?;
        Ok(())
    })
    .await?;

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (mut stream, leftover) =
        timeout(Duration::from_secs(5), handshake::login(stream, "alice", "hunter2")).await??;

    // Whatever was over-read plus the rest of the stream is the payload.
    let mut payload = leftover.to_vec();
    let mut buf = [0u8; 8];
    while payload.len() < 3 {
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;
        assert_ne!(n, 0, "stream ended before the payload arrived");
        payload.extend_from_slice(&buf[..n]);
    }

    assert_eq!(payload, b"abc");

    server.await??;

    Ok(())
}

#[tokio::test]
async fn wrong_banner_is_rejected() -> Result<()> {
    let (port, _server) = raw_server(|mut stream| async move {
        stream.write_all(b"SOME OTHER SERVICE\r\n").await?;
        Ok(())
    })
    .await?;

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let err = timeout(Duration::from_secs(5), handshake::login(stream, "u", "p"))
        .await?
        .unwrap_err();

    match err {
        Error::HandshakeRejected(line) => assert_eq!(line, "SOME OTHER SERVICE"),
        other => panic!("expected HandshakeRejected, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn bad_credentials_are_auth_failed() -> Result<()> {
    let (port, server) = raw_server(|mut stream| async move {
        stream.write_all(b"VESPER PPP 1\r\nLOGIN:\r\n").await?;
        let _ = read_line(&mut stream).await?;
        stream.write_all(b"PASSWORD:\r\n").await?;
        let _ = read_line(&mut stream).await?;
        stream.write_all(b"BADAUTH\r\n").await?;
        Ok(())
    })
    .await?;

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let err = timeout(Duration::from_secs(5), handshake::login(stream, "u", "p"))
        .await?
        .unwrap_err();

    match err {
        Error::AuthFailed(line) => assert_eq!(line, "BADAUTH"),
        other => panic!("expected AuthFailed, got {other:?}"),
    }

    server.await??;

    Ok(())
}

#[tokio::test]
async fn truncated_exchange_times_out() -> Result<()> {
    let (port, _server) = raw_server(|mut stream| async move {
        stream.write_all(b"VESPER PPP 1\r\nLOGIN:\r\n").await?;
        let _ = read_line(&mut stream).await?;
        // Hang up mid-exchange.
        Ok(())
    })
    .await?;

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let err = timeout(Duration::from_secs(5), handshake::login(stream, "u", "p"))
        .await?
        .unwrap_err();

    assert!(matches!(err, Error::HandshakeTimeout), "got {err:?}");

    Ok(())
}

#[tokio::test]
async fn identical_handshakes_exchange_identical_bytes() -> Result<()> {
    // Two fresh sockets, same script: the server must see the same lines.
    for _ in 0..2 {
        let (port, server) = common::spawn_server(
            common::ServerScript::good(common::AfterLogin::Close),
            1,
        )
        .await?;

        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        timeout(Duration::from_secs(5), handshake::login(stream, "u", "p")).await??;

        let seen = server.await??;
        assert_eq!(seen.username, "u");
        assert_eq!(seen.password, "p");
    }

    Ok(())
}
