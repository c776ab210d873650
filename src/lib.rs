#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Local device endpoints: serial ports, PTYs, sockets and pipes behind
/// one byte-stream handle.
pub mod device;

/// Possible errors in this library.
pub mod error;

/// The framed login exchange performed against the remote server.
pub mod handshake;

/// Logging/tracing setup.
pub mod logging;

/// The Hayes AT command interpreter.
pub mod modem;

/// The full-duplex byte pump between device and remote.
pub mod pump;

/// The session supervisor which drives the connection lifecycle.
pub mod session;
