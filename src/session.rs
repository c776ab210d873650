//! The session supervisor.
//!
//! A flat state machine driving the connection lifecycle: wait for a dial
//! (when emulating), connect, authenticate, pump, tear down, and retry
//! where the policy allows. The supervisor exclusively owns the device,
//! the remote socket and the modem state; everything runs on one task.

use std::fmt::Display;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    device::Device,
    error::Error,
    handshake,
    modem::{Modem, ModemAction, ResultCode},
    pump::{self, PumpExit},
};

/// Give up on a TCP connect after this long; maps to `NO ANSWER`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An online period at least this long refills the retry budget.
const RETRY_RESET_AFTER: Duration = Duration::from_secs(30);

/// Backoff ceiling between connection attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How long teardown may spend draining the device.
const TEARDOWN_DRAIN: Duration = Duration::from_secs(2);

/// The lifecycle states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing is happening yet.
    Idle,

    /// Emulating; AT commands are being interpreted until a dial.
    WaitingForDial,

    /// A TCP connection attempt is in flight.
    Connecting,

    /// The login exchange is in flight.
    Authenticating,

    /// The pump is moving session bytes.
    Online,

    /// The session is being dismantled.
    TearingDown,

    /// The retry budget is spent.
    Failed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::WaitingForDial => "WAITING_FOR_DIAL",
            SessionState::Connecting => "CONNECTING",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Online => "ONLINE",
            SessionState::TearingDown => "TEARING_DOWN",
            SessionState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// How a supervisor run ended, when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The session ran its course.
    Clean,

    /// A shutdown signal cut the session short.
    Interrupted,
}

/// How one dial's session ended.
enum DialEnd {
    BackToCommand,
    DeviceClosed,
    Cancelled,
}

/// What ended the suspended (online-command) dialogue.
enum OnlineCommandEnd {
    Resume,
    Hangup,
    DeviceClosed,
    Cancelled,
}

/// Owns the device, the modem state and (while online) the remote
/// socket, and runs the session to completion.
pub struct Supervisor {
    config: Config,
    device: Device,
    modem: Modem,
    cancel: CancellationToken,
}

impl Supervisor {
    /// A supervisor over an already-opened device.
    pub fn new(config: Config, device: Device, cancel: CancellationToken) -> Self {
        let modem = Modem::new(config.connect_speed);

        Self {
            config,
            device,
            modem,
            cancel,
        }
    }

    /// Drive the session until it ends or is cancelled.
    pub async fn run(mut self) -> Result<Outcome, Error> {
        info!(
            state = %SessionState::Idle,
            device = %self.config.device,
            emulate = self.config.emulate_modem,
            "Session starting"
        );

        // Signal readiness on the line.
        self.device.set_dtr(true)?;
        self.device.set_rts(true)?;

        if self.config.emulate_modem {
            self.run_modem().await
        } else {
            self.run_direct().await
        }
    }

    /// Emulation: interpret AT commands until a dial, bridge, repeat.
    async fn run_modem(mut self) -> Result<Outcome, Error> {
        info!(state = %SessionState::WaitingForDial, "Waiting for dial");

        let mut buf = vec![0u8; 1024];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.device.read(&mut buf) => Some(result),
            };

            let Some(result) = read else {
                self.teardown().await;
                return Ok(Outcome::Interrupted);
            };

            let n = result.map_err(Error::DeviceIo)?;
            if n == 0 {
                info!("Device closed, session over");
                return Ok(Outcome::Clean);
            }

            let reply = self.modem.feed(&buf[..n], Instant::now());
            if !reply.output.is_empty() {
                self.write_device(&reply.output).await?;
            }

            // Hangup and resume cannot arise in command mode, so a dial
            // is the only event left.
            if let Some(ModemAction::Dial(number)) = reply.action {
                match self.dial(&number).await? {
                    DialEnd::BackToCommand => {
                        info!(state = %SessionState::WaitingForDial, "Waiting for dial")
                    }
                    DialEnd::DeviceClosed => {
                        info!("Device closed, session over");
                        return Ok(Outcome::Clean);
                    }
                    DialEnd::Cancelled => {
                        self.teardown().await;
                        return Ok(Outcome::Interrupted);
                    }
                }
            }
        }
    }

    /// One dial: connect, authenticate, then pump until the session dies
    /// or the user escapes out and hangs up.
    async fn dial(&mut self, number: &str) -> Result<DialEnd, Error> {
        info!(
            state = %SessionState::Connecting,
            %number,
            server = %self.config.server_endpoint(),
            "Dialling"
        );

        let attempt = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = connect_and_login(&self.config) => Some(result),
        };

        let Some(result) = attempt else {
            return Ok(DialEnd::Cancelled);
        };

        let (mut remote, leftover) = match result {
            Ok(connected) => connected,
            Err(e) => {
                warn!(%e, "Dial failed");
                let out = self.modem.dial_failed(dial_failure_code(&e));
                self.write_device(&out).await?;
                return Ok(DialEnd::BackToCommand);
            }
        };

        info!(state = %SessionState::Online, "Carrier up");

        let connect = self.modem.dial_succeeded();
        self.write_device(&connect).await?;
        // The result code must be on the wire before session data.
        self.device.flush().await.map_err(Error::DeviceIo)?;

        let mut pending = leftover;

        loop {
            let result = pump::run(
                &mut self.device,
                &mut remote,
                std::mem::take(&mut pending),
                Some(&mut self.modem),
                self.config.inactivity(),
                &self.cancel,
            )
            .await;

            let report = match result {
                Ok(report) => report,
                Err(Error::DeviceIo(e)) => {
                    // Treated as carrier loss; if the device is truly
                    // gone the command loop will find out.
                    warn!(%e, "Device trouble while online, dropping carrier");
                    let _ = remote.shutdown().await;
                    return Ok(DialEnd::BackToCommand);
                }
                Err(e) => return Err(e),
            };

            match report.exit {
                PumpExit::Escape => match self.online_command().await? {
                    OnlineCommandEnd::Resume => {
                        debug!("Resuming data mode");
                        continue;
                    }
                    OnlineCommandEnd::Hangup => {
                        info!(state = %SessionState::TearingDown, "Hung up");
                        let _ = remote.shutdown().await;
                        return Ok(DialEnd::BackToCommand);
                    }
                    OnlineCommandEnd::DeviceClosed => {
                        let _ = remote.shutdown().await;
                        return Ok(DialEnd::DeviceClosed);
                    }
                    OnlineCommandEnd::Cancelled => {
                        let _ = remote.shutdown().await;
                        return Ok(DialEnd::Cancelled);
                    }
                },
                PumpExit::RemoteClosed | PumpExit::Inactivity => {
                    if let Some(e) = report.exit.as_error() {
                        warn!(%e, state = %SessionState::TearingDown, "Session ended");
                    }
                    let _ = remote.shutdown().await;
                    let out = self.modem.carrier_lost();
                    self.write_device(&out).await?;
                    return Ok(DialEnd::BackToCommand);
                }
                PumpExit::DeviceClosed => {
                    let _ = remote.shutdown().await;
                    return Ok(DialEnd::DeviceClosed);
                }
                PumpExit::Cancelled => {
                    let _ = remote.shutdown().await;
                    return Ok(DialEnd::Cancelled);
                }
            }
        }
    }

    /// The suspended dialogue after `+++`: AT parsing with the carrier
    /// still up, until `ATO`, a hang-up, or the device goes away.
    async fn online_command(&mut self) -> Result<OnlineCommandEnd, Error> {
        debug!("Suspended command mode");

        let mut buf = vec![0u8; 512];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.device.read(&mut buf) => Some(result),
            };

            let Some(result) = read else {
                return Ok(OnlineCommandEnd::Cancelled);
            };

            let n = result.map_err(Error::DeviceIo)?;
            if n == 0 {
                return Ok(OnlineCommandEnd::DeviceClosed);
            }

            let reply = self.modem.feed(&buf[..n], Instant::now());
            if !reply.output.is_empty() {
                self.write_device(&reply.output).await?;
            }

            match reply.action {
                Some(ModemAction::Resume) => {
                    // OK must be flushed before data flows again.
                    self.device.flush().await.map_err(Error::DeviceIo)?;
                    return Ok(OnlineCommandEnd::Resume);
                }
                Some(ModemAction::Hangup) => return Ok(OnlineCommandEnd::Hangup),
                Some(ModemAction::Dial(_)) => {
                    debug!("Dial rejected while a carrier is up")
                }
                None => {}
            }
        }
    }

    /// Direct bridging: connect immediately and reconnect per the retry
    /// policy. Device EOF is terminal.
    async fn run_direct(mut self) -> Result<Outcome, Error> {
        let mut failures: u32 = 0;

        loop {
            info!(
                state = %SessionState::Connecting,
                attempt = failures + 1,
                server = %self.config.server_endpoint(),
                "Connecting to server"
            );

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = connect_and_login(&self.config) => Some(result),
            };

            let Some(result) = attempt else {
                self.teardown().await;
                return Ok(Outcome::Interrupted);
            };

            let (mut remote, leftover) = match result {
                Ok(connected) => connected,
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures > self.config.connection_retries {
                        error!(%e, state = %SessionState::Failed, "Retries exhausted");
                        return Err(e);
                    }

                    let delay = backoff_delay(failures);
                    warn!(%e, ?delay, "Connection attempt failed, backing off");

                    if self.sleep_cancellable(delay).await {
                        self.teardown().await;
                        return Ok(Outcome::Interrupted);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!(state = %SessionState::Online, "Bridge up");

            let started = Instant::now();
            let result = pump::run(
                &mut self.device,
                &mut remote,
                leftover,
                None,
                self.config.inactivity(),
                &self.cancel,
            )
            .await;

            let _ = remote.shutdown().await;
            let report = result?;

            if started.elapsed() >= RETRY_RESET_AFTER {
                failures = 0;
            }

            match report.exit.as_error() {
                Some(e) => warn!(%e, state = %SessionState::TearingDown, "Session ended"),
                None => info!(state = %SessionState::TearingDown, "Session ended"),
            }

            match report.exit {
                PumpExit::Cancelled => {
                    self.teardown().await;
                    return Ok(Outcome::Interrupted);
                }
                PumpExit::DeviceClosed | PumpExit::Escape => return Ok(Outcome::Clean),
                PumpExit::RemoteClosed | PumpExit::Inactivity => {
                    if self.config.connection_retries == 0 {
                        return Ok(Outcome::Clean);
                    }

                    failures += 1;
                    if failures > self.config.connection_retries {
                        info!("Reconnect budget spent");
                        return Ok(Outcome::Clean);
                    }

                    let delay = backoff_delay(failures);
                    info!(?delay, "Reconnecting after backoff");

                    if self.sleep_cancellable(delay).await {
                        self.teardown().await;
                        return Ok(Outcome::Interrupted);
                    }
                }
            }
        }
    }

    async fn write_device(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.device.write_all(bytes).await.map_err(Error::DeviceIo)
    }

    /// Returns true when the sleep was cut short by cancellation.
    async fn sleep_cancellable(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn teardown(&mut self) {
        info!(state = %SessionState::TearingDown, "Draining device");

        let _ = self.device.set_dtr(false);
        let _ = timeout(TEARDOWN_DRAIN, self.device.flush()).await;
    }
}

/// Open the remote connection and run the login exchange.
async fn connect_and_login(config: &Config) -> Result<(TcpStream, BytesMut), Error> {
    let endpoint = config.server_endpoint();

    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint)).await {
        Err(_elapsed) => {
            return Err(Error::RemoteUnreachable {
                endpoint,
                timed_out: true,
            })
        }
        Ok(Err(e)) => {
            return Err(Error::RemoteUnreachable {
                endpoint: format!("{endpoint} ({e})"),
                timed_out: false,
            })
        }
        Ok(Ok(stream)) => stream,
    };

    let _ = stream.set_nodelay(true);

    info!(%endpoint, state = %SessionState::Authenticating, "Connected, logging in");

    handshake::login(stream, &config.username, &config.password).await
}

/// The result code a failed dial reports to the terminal.
fn dial_failure_code(e: &Error) -> ResultCode {
    match e {
        // A server that reports itself busy is the one case for BUSY.
        Error::AuthFailed(reply) if reply.to_ascii_uppercase().contains("BUSY") => ResultCode::Busy,
        Error::AuthFailed(_) => ResultCode::NoCarrier,
        Error::RemoteUnreachable { timed_out: true, .. } => ResultCode::NoAnswer,
        _ => ResultCode::NoCarrier,
    }
}

/// Exponential backoff from 1 s doubling to [`BACKOFF_CAP`], with ±20%
/// jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    let base = Duration::from_secs(1 << exp).min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);

    base.mul_f64(jitter)
}
