use std::io;

use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration record could not be loaded or failed validation.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The local device could not be opened (missing, busy, denied).
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device specifier or its parameters make no sense.
    #[error("Device misconfigured: {0}")]
    DeviceMisconfigured(String),

    /// An I/O problem on an already-open device.
    #[error("Device I/O problem")]
    DeviceIo(#[source] io::Error),

    /// The remote server could not be reached.
    #[error("Remote {endpoint} unreachable")]
    RemoteUnreachable {
        /// The `host:port` that was dialled.
        endpoint: String,

        /// Whether the connect attempt timed out rather than being
        /// refused outright. Maps to `NO ANSWER` when emulating.
        timed_out: bool,
    },

    /// The server did not complete the login exchange in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The server sent something other than the expected banner/prompt.
    #[error("Handshake rejected: `{0}`")]
    HandshakeRejected(String),

    /// The server rejected the supplied credentials.
    #[error("Authentication failed: `{0}`")]
    AuthFailed(String),

    /// No bytes crossed the bridge within the configured window.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    /// The remote side went away while a session was up.
    #[error("Carrier lost")]
    CarrierLost,

    /// The bridge was told to shut down.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the supervisor may retry the connection after this error.
    ///
    /// Only pre-session failures are retryable; see the retry policy in
    /// [`crate::session`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnreachable { .. }
                | Error::HandshakeTimeout
                | Error::HandshakeRejected(_)
                | Error::AuthFailed(_)
        )
    }
}
