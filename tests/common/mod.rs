#![allow(dead_code)]

use std::time::Duration;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use vesper_bridge::{
    config::Config,
    device::{Device, DeviceSpec},
    error::Error,
    session::{Outcome, Supervisor},
};

/// The banner a well-behaved server greets with.
pub const GOOD_BANNER: &str = "VESPER PPP 1";

/// What the scripted server does once the login lines are done.
#[derive(Debug, Clone)]
pub enum AfterLogin {
    /// Send these bytes, then echo everything back until the peer closes.
    SendThenEcho(Vec<u8>),

    /// Echo everything back until the peer closes.
    Echo,

    /// Close right away.
    Close,

    /// Keep the socket open, send nothing.
    Idle,
}

/// A canned server side of the login exchange.
#[derive(Debug, Clone)]
pub struct ServerScript {
    pub banner: String,
    pub verdict: String,
    pub after: AfterLogin,
}

impl ServerScript {
    pub fn good(after: AfterLogin) -> Self {
        Self {
            banner: GOOD_BANNER.into(),
            verdict: "OK".into(),
            after,
        }
    }

    pub fn bad_auth() -> Self {
        Self {
            banner: GOOD_BANNER.into(),
            verdict: "BADAUTH".into(),
            after: AfterLogin::Close,
        }
    }
}

/// The credentials a scripted server saw on its last connection.
#[derive(Debug)]
pub struct LoginSeen {
    pub username: String,
    pub password: String,
}

async fn send_line(stream: &mut BufReader<TcpStream>, line: &str) -> Result<()> {
    stream
        .get_mut()
        .write_all(format!("{line}\r\n").as_bytes())
        .await?;
    Ok(())
}

async fn recv_line(stream: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}

async fn echo(stream: &mut BufReader<TcpStream>) -> Result<()> {
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.get_mut().write_all(&buf[..n]).await?;
    }
}

async fn run_script(stream: TcpStream, script: ServerScript) -> Result<LoginSeen> {
    let mut stream = BufReader::new(stream);

    send_line(&mut stream, &script.banner).await?;
    send_line(&mut stream, "LOGIN:").await?;
    let username = recv_line(&mut stream).await?;

    send_line(&mut stream, "PASSWORD:").await?;
    let password = recv_line(&mut stream).await?;

    send_line(&mut stream, &script.verdict).await?;

    match script.after {
        AfterLogin::Close => {}
        AfterLogin::Idle => {
            let mut buf = [0u8; 1024];
            loop {
                if stream.read(&mut buf).await? == 0 {
                    break;
                }
            }
        }
        AfterLogin::SendThenEcho(payload) => {
            stream.get_mut().write_all(&payload).await?;
            echo(&mut stream).await?;
        }
        AfterLogin::Echo => echo(&mut stream).await?,
    }

    Ok(LoginSeen { username, password })
}

/// Run a scripted PPP server on an ephemeral port, serving `accepts`
/// sequential connections. Resolves to the credentials of the last one.
pub async fn spawn_server(
    script: ServerScript,
    accepts: usize,
) -> Result<(u16, JoinHandle<Result<LoginSeen>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        let mut last = None;

        for _ in 0..accepts {
            let (stream, _) = listener.accept().await?;
            last = Some(run_script(stream, script.clone()).await?);
        }

        last.ok_or_else(|| color_eyre::eyre::eyre!("Server accepted no connections"))
    });

    Ok((port, handle))
}

/// A config pointing at a scripted server; the terminal device is filled
/// in by [`start_bridge`].
pub fn test_config(server_port: u16) -> Config {
    Config {
        username: "u".into(),
        password: "p".into(),
        server_host: "127.0.0.1".into(),
        server_port,
        emulate_modem: false,
        inactivity_timeout: 0,
        connection_retries: 0,
        log_file: None,
        ..Default::default()
    }
}

/// Start a supervisor over a `tcp:` device and hand back the terminal
/// side of that device.
pub async fn start_bridge(
    mut config: Config,
) -> Result<(
    TcpStream,
    JoinHandle<Result<Outcome, Error>>,
    CancellationToken,
)> {
    let terminal_listener = TcpListener::bind("127.0.0.1:0").await?;
    let terminal_addr = terminal_listener.local_addr()?;

    config.device = format!("tcp:127.0.0.1:{}", terminal_addr.port());

    let spec = DeviceSpec::parse(&config.device, config.baud_rate)?;

    let (device, accepted) = tokio::join!(Device::open(&spec), terminal_listener.accept());
    let device = device?;
    let (terminal, _) = accepted?;

    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new(config, device, cancel.clone());
    let handle = tokio::spawn(supervisor.run());

    Ok((terminal, handle, cancel))
}

/// Read exactly `expected.len()` bytes and compare.
pub async fn expect_bytes(stream: &mut TcpStream, expected: &[u8]) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];

    timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await??;

    assert_eq!(
        buf.as_slice(),
        expected,
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&buf)
    );

    Ok(())
}
