//! The full-duplex byte pump coupling the local device to the remote
//! socket while a session is online.
//!
//! A single task multiplexes both directions, the inactivity timer and
//! the escape guard timer. Each direction reads into its own working
//! buffer and writes the whole chunk to the opposite side before reading
//! again, so one side can stall the other for at most one buffer's
//! transfer.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{device::Device, error::Error, modem::Modem};

/// Working buffer size per direction.
const BUFFER_SIZE: usize = 4096;

/// How long to keep flushing each side on the way out.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The remote closed the connection or its transport failed.
    RemoteClosed,

    /// The device reached end of stream.
    DeviceClosed,

    /// The escape sequence was confirmed; the session stays up.
    Escape,

    /// Nothing crossed the bridge within the inactivity window.
    Inactivity,

    /// Shutdown was requested.
    Cancelled,
}

impl PumpExit {
    /// The error this exit reason corresponds to, for reporting. Device
    /// EOF and escape are not errors.
    pub fn as_error(&self) -> Option<Error> {
        match self {
            PumpExit::RemoteClosed => Some(Error::CarrierLost),
            PumpExit::Inactivity => Some(Error::InactivityTimeout),
            PumpExit::Cancelled => Some(Error::Cancelled),
            PumpExit::DeviceClosed | PumpExit::Escape => None,
        }
    }
}

/// What a pump run did.
#[derive(Debug)]
pub struct PumpReport {
    /// Why the pump stopped.
    pub exit: PumpExit,

    /// Bytes moved device → remote.
    pub bytes_to_remote: u64,

    /// Bytes moved remote → device.
    pub bytes_to_device: u64,
}

enum WriteEnd {
    Done,
    Cancelled,
    Failed(std::io::Error),
}

async fn write_side<W>(side: &mut W, data: &[u8], cancel: &CancellationToken) -> WriteEnd
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => WriteEnd::Cancelled,
        result = side.write_all(data) => match result {
            Ok(()) => WriteEnd::Done,
            Err(e) => WriteEnd::Failed(e),
        },
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Shuttle bytes between `device` and `remote` until something ends the
/// session.
///
/// `pending_remote` is written to the device before anything else (bytes
/// the handshake over-read). When a modem is passed in, its escape
/// detection observes a copy of the device-sourced stream; the bytes are
/// forwarded regardless.
pub async fn run(
    device: &mut Device,
    remote: &mut TcpStream,
    pending_remote: BytesMut,
    mut modem: Option<&mut Modem>,
    inactivity: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<PumpReport, Error> {
    let mut bytes_to_remote: u64 = 0;
    let mut bytes_to_device: u64 = 0;

    if !pending_remote.is_empty() {
        trace!(n = pending_remote.len(), "Delivering bytes held over from the handshake");
        device
            .write_all(&pending_remote)
            .await
            .map_err(Error::DeviceIo)?;
        bytes_to_device += pending_remote.len() as u64;
    }

    let mut device_buf = vec![0u8; BUFFER_SIZE];
    let mut remote_buf = vec![0u8; BUFFER_SIZE];
    let mut last_activity = Instant::now();

    let (mut device_rx, mut device_tx) = tokio::io::split(&mut *device);
    let (mut remote_rx, mut remote_tx) = remote.split();

    let exit = loop {
        let escape_at = modem.as_ref().and_then(|m| m.escape_deadline());
        let idle_at = inactivity.map(|window| last_activity + window);

        enum Event {
            Cancelled,
            Device(std::io::Result<usize>),
            Remote(std::io::Result<usize>),
            EscapeTimer,
            IdleTimer,
        }

        let event = tokio::select! {
            _ = cancel.cancelled() => Event::Cancelled,
            result = device_rx.read(&mut device_buf) => Event::Device(result),
            result = remote_rx.read(&mut remote_buf) => Event::Remote(result),
            _ = sleep_until_opt(escape_at), if escape_at.is_some() => Event::EscapeTimer,
            _ = sleep_until_opt(idle_at), if idle_at.is_some() => Event::IdleTimer,
        };

        match event {
            Event::Cancelled => break PumpExit::Cancelled,
            Event::Device(Err(e)) => {
                let _ = timeout(DRAIN_TIMEOUT, remote_tx.flush()).await;
                return Err(Error::DeviceIo(e));
            }
            Event::Device(Ok(0)) => break PumpExit::DeviceClosed,
            Event::Device(Ok(n)) => {
                let now = Instant::now();

                if let Some(m) = modem.as_deref_mut() {
                    // Observation only; the bytes still go to the remote.
                    let _ = m.feed(&device_buf[..n], now);
                }

                match write_side(&mut remote_tx, &device_buf[..n], cancel).await {
                    WriteEnd::Done => {}
                    WriteEnd::Cancelled => break PumpExit::Cancelled,
                    WriteEnd::Failed(e) => {
                        debug!(%e, "Remote write failed");
                        break PumpExit::RemoteClosed;
                    }
                }

                bytes_to_remote += n as u64;
                last_activity = now;
            }
            Event::Remote(Err(e)) => {
                debug!(%e, "Remote read failed");
                break PumpExit::RemoteClosed;
            }
            Event::Remote(Ok(0)) => break PumpExit::RemoteClosed,
            Event::Remote(Ok(n)) => {
                match write_side(&mut device_tx, &remote_buf[..n], cancel).await {
                    WriteEnd::Done => {}
                    WriteEnd::Cancelled => break PumpExit::Cancelled,
                    WriteEnd::Failed(e) => {
                        let _ = timeout(DRAIN_TIMEOUT, remote_tx.flush()).await;
                        return Err(Error::DeviceIo(e));
                    }
                }

                bytes_to_device += n as u64;
                last_activity = Instant::now();
            }
            Event::EscapeTimer => {
                let Some(m) = modem.as_deref_mut() else {
                    continue;
                };
                if let Some(ok) = m.confirm_escape(Instant::now()) {
                    if let WriteEnd::Failed(e) = write_side(&mut device_tx, &ok, cancel).await {
                        return Err(Error::DeviceIo(e));
                    }
                    break PumpExit::Escape;
                }
            }
            Event::IdleTimer => {
                warn!("No traffic within the inactivity window");
                break PumpExit::Inactivity;
            }
        }
    };

    // Bounded drain; bytes in flight at a hard failure are forfeit.
    let _ = timeout(DRAIN_TIMEOUT, device_tx.flush()).await;
    let _ = timeout(DRAIN_TIMEOUT, remote_tx.flush()).await;

    debug!(?exit, bytes_to_remote, bytes_to_device, "Pump stopped");

    Ok(PumpReport {
        exit,
        bytes_to_remote,
        bytes_to_device,
    })
}
