//! The login exchange performed over a fresh server connection.
//!
//! Four CR LF-framed ASCII lines cross before any payload may: the server
//! banner, a login prompt, a password prompt, and a verdict. On any
//! failure the socket is closed and never reused.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info};

use crate::error::Error;

/// What a server banner must start with to be acceptable.
pub const BANNER_PREFIX: &str = "VESPER PPP";

/// How long to wait for each server line.
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest server line we are willing to buffer.
const MAX_LINE: usize = 512;

/// This codec reads CR LF-delimited lines (tolerating bare LF) and
/// appends CR LF to each line it encodes.
#[derive(Debug, Default)]
pub(crate) struct LineCodec {
    /// How far we have looked for a newline into the buffer.
    cursor: usize,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        if let Some(position) = src[self.cursor..read_to]
            .iter()
            .position(|&byte| byte == b'\n')
        {
            let actual_position = self.cursor + position;
            self.cursor = 0;

            let mut line = src.split_to(actual_position);
            src.advance(1);

            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            let line = String::from_utf8_lossy(&line).into_owned();
            Ok(Some(line))
        } else if read_to > MAX_LINE {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Server line too long",
            ))
        } else {
            // Look only at fresh bytes next time.
            self.cursor = read_to;
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

async fn read_line(framed: &mut Framed<TcpStream, LineCodec>) -> Result<String, Error> {
    match timeout(READ_TIMEOUT, framed.next()).await {
        // No line within the window, or the stream ended mid-exchange.
        Err(_elapsed) => Err(Error::HandshakeTimeout),
        Ok(None) => Err(Error::HandshakeTimeout),
        Ok(Some(Err(e))) => Err(Error::HandshakeRejected(e.to_string())),
        Ok(Some(Ok(line))) => Ok(line),
    }
}

async fn send_line(
    framed: &mut Framed<TcpStream, LineCodec>,
    line: String,
) -> Result<(), Error> {
    // A failed write means the exchange was truncated.
    framed.send(line).await.map_err(|_| Error::HandshakeTimeout)
}

async fn expect_prompt(
    framed: &mut Framed<TcpStream, LineCodec>,
    prompt: &str,
) -> Result<(), Error> {
    let line = read_line(framed).await?;

    if line.trim() == prompt {
        Ok(())
    } else {
        Err(Error::HandshakeRejected(line))
    }
}

/// Log in to the server over a freshly opened socket.
///
/// On success the socket is handed back together with any bytes the
/// server sent beyond the final `OK` line; those belong to the session
/// and must reach the device first.
pub async fn login(
    stream: TcpStream,
    username: &str,
    password: &str,
) -> Result<(TcpStream, BytesMut), Error> {
    let mut framed = Framed::new(stream, LineCodec::default());

    let banner = read_line(&mut framed).await?;
    if !banner.starts_with(BANNER_PREFIX) {
        return Err(Error::HandshakeRejected(banner));
    }
    debug!(%banner, "Server banner accepted");

    expect_prompt(&mut framed, "LOGIN:").await?;
    send_line(&mut framed, username.to_owned()).await?;

    expect_prompt(&mut framed, "PASSWORD:").await?;
    send_line(&mut framed, password.to_owned()).await?;

    let verdict = read_line(&mut framed).await?;
    if verdict.trim() != "OK" {
        return Err(Error::AuthFailed(verdict));
    }

    info!(%username, "Authenticated with server");

    let parts = framed.into_parts();

    Ok((parts.io, parts.read_buf))
}
