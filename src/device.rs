use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serialport::SerialPort;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::Error;

/// A parsed local device specifier.
///
/// The textual grammar is:
///
/// ```text
/// spec := "unix:" path
///       | "tcp:" host ":" port
///       | "pipe:" name
///       | "\\.\pipe\" name
///       | "COM" integer
///       | absolute-filesystem-path
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// A native serial port. Baud and 8N1 framing apply.
    Serial {
        /// Path such as `/dev/ttyUSB0` or `COM3`.
        path: String,

        /// Baud rate to configure on the port.
        baud: u32,
    },

    /// A pseudo-terminal slave. Line signals are best-effort no-ops.
    Pty {
        /// Path such as `/dev/pts/4`.
        path: String,
    },

    /// A Unix domain socket: connect when the path exists, otherwise
    /// listen there and accept exactly one peer.
    Unix {
        /// Filesystem path of the socket.
        path: String,
    },

    /// A TCP socket: connect, or on refusal bind and accept one peer.
    Tcp {
        /// Host to dial or bind.
        host: String,

        /// Port to dial or bind.
        port: u16,
    },

    /// A Windows named pipe, byte mode.
    Pipe {
        /// The pipe name without the `\\.\pipe\` prefix.
        name: String,
    },
}

const PIPE_PREFIX: &str = r"\\.\pipe\";

impl DeviceSpec {
    /// Parse a device specifier string.
    ///
    /// `baud` is attached to serial specs; other kinds ignore it.
    pub fn parse(spec: &str, baud: u32) -> Result<Self, Error> {
        if let Some(path) = spec.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::DeviceMisconfigured(
                    "Empty path in unix: device".into(),
                ));
            }
            return Ok(Self::Unix { path: path.into() });
        }

        if let Some(rest) = spec.strip_prefix("tcp:") {
            let Some((host, port)) = rest.rsplit_once(':') else {
                return Err(Error::DeviceMisconfigured(format!(
                    "`{spec}` should look like tcp:host:port"
                )));
            };
            let port = port.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| {
                Error::DeviceMisconfigured(format!("Bad port in `{spec}`"))
            })?;
            if host.is_empty() {
                return Err(Error::DeviceMisconfigured(format!("Bad host in `{spec}`")));
            }
            return Ok(Self::Tcp {
                host: host.into(),
                port,
            });
        }

        if let Some(name) = spec.strip_prefix("pipe:").or_else(|| spec.strip_prefix(PIPE_PREFIX)) {
            if name.is_empty() {
                return Err(Error::DeviceMisconfigured("Empty pipe name".into()));
            }
            return Ok(Self::Pipe { name: name.into() });
        }

        if let Some(num) = spec.strip_prefix("COM") {
            if num.parse::<u32>().is_ok() {
                return Ok(Self::Serial {
                    path: spec.into(),
                    baud,
                });
            }
        }

        if spec.starts_with('/') {
            if spec.starts_with("/dev/pts/") {
                return Ok(Self::Pty { path: spec.into() });
            }
            return Ok(Self::Serial {
                path: spec.into(),
                baud,
            });
        }

        Err(Error::DeviceMisconfigured(format!(
            "Could not make sense of device `{spec}`"
        )))
    }
}

impl Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Serial { path, baud } => write!(f, "serial: {path} @ {baud}"),
            DeviceSpec::Pty { path } => write!(f, "pty: {path}"),
            DeviceSpec::Unix { path } => write!(f, "unix: {path}"),
            DeviceSpec::Tcp { host, port } => write!(f, "tcp: {host}:{port}"),
            DeviceSpec::Pipe { name } => write!(f, "pipe: {name}"),
        }
    }
}

fn try_create_serial_port(path: &str, baud: u32) -> Result<SerialStream, Error> {
    tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open_native_async()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::InvalidInput => {
                Error::DeviceMisconfigured(format!("Could not open port at {path}: {e}"))
            }
            _ => Error::DeviceUnavailable(format!("Could not open port at {path}: {e}")),
        })
}

async fn connect_or_accept_tcp(host: &str, port: u16) -> Result<TcpStream, Error> {
    let addr = format!("{host}:{port}");

    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => {
            info!(%addr, "Connected to TCP device peer");
            stream
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| Error::DeviceUnavailable(format!("Could not bind {addr}: {e}")))?;

            info!(%addr, "Waiting for a TCP device peer");

            let (stream, peer) = listener.accept().await.map_err(Error::DeviceIo)?;
            info!(%peer, "TCP device peer connected");
            stream
        }
        Err(e) => return Err(Error::DeviceUnavailable(format!("{addr}: {e}"))),
    };

    stream.set_nodelay(true).map_err(Error::DeviceIo)?;

    Ok(stream)
}

#[cfg(unix)]
async fn connect_or_accept_unix(path: &str) -> Result<UnixStream, Error> {
    if std::path::Path::new(path).exists() {
        info!(%path, "Connecting to Unix socket");

        UnixStream::connect(path)
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("{path}: {e}")))
    } else {
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::DeviceUnavailable(format!("Could not bind {path}: {e}")))?;

        info!(%path, "Waiting for a Unix socket peer");

        let (stream, _) = listener.accept().await.map_err(Error::DeviceIo)?;
        info!(%path, "Unix socket peer connected");

        Ok(stream)
    }
}

/// A local endpoint, opened and normalised into a single byte stream.
///
/// All variants present the same semantics to the pump and supervisor:
/// async reads yielding partial chunks, possibly-short writes handled by
/// [`tokio::io::AsyncWriteExt`], and flush for draining. Line signals
/// (DTR/RTS) are real on serial ports and no-ops elsewhere.
#[derive(Debug)]
pub enum Device {
    /// A native serial port.
    Serial(SerialStream),

    /// A pseudo-terminal. DTR/RTS are accepted but not propagated.
    Pty(SerialStream),

    /// A Unix domain socket, either dialled or accepted.
    #[cfg(unix)]
    Unix(UnixStream),

    /// A TCP socket, either dialled or accepted.
    Tcp(TcpStream),

    /// A named pipe this process dialled.
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),

    /// A named pipe this process created and a peer dialled.
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
}

impl Device {
    /// Open the device described by `spec`.
    pub async fn open(spec: &DeviceSpec) -> Result<Self, Error> {
        debug!(%spec, "Opening device");

        match spec {
            DeviceSpec::Serial { path, baud } => {
                let stream = try_create_serial_port(path, *baud)?;
                info!(%path, %baud, "Serial port open");
                Ok(Device::Serial(stream))
            }
            DeviceSpec::Pty { path } => {
                // A PTY is a tty without real line signals; same open
                // path, nominal baud.
                let stream = try_create_serial_port(path, 38_400)?;
                info!(%path, "PTY open");
                Ok(Device::Pty(stream))
            }
            #[cfg(unix)]
            DeviceSpec::Unix { path } => Ok(Device::Unix(connect_or_accept_unix(path).await?)),
            #[cfg(not(unix))]
            DeviceSpec::Unix { path } => Err(Error::DeviceMisconfigured(format!(
                "Unix sockets are not supported on this platform: {path}"
            ))),
            DeviceSpec::Tcp { host, port } => {
                Ok(Device::Tcp(connect_or_accept_tcp(host, *port).await?))
            }
            #[cfg(windows)]
            DeviceSpec::Pipe { name } => Self::open_pipe(name).await,
            #[cfg(not(windows))]
            DeviceSpec::Pipe { name } => Err(Error::DeviceMisconfigured(format!(
                "Named pipes are not supported on this platform: {name}"
            ))),
        }
    }

    #[cfg(windows)]
    async fn open_pipe(name: &str) -> Result<Self, Error> {
        use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

        const ERROR_FILE_NOT_FOUND: i32 = 2;

        let path = format!("{PIPE_PREFIX}{name}");

        match ClientOptions::new().open(&path) {
            Ok(client) => {
                info!(%path, "Connected to named pipe");
                Ok(Device::PipeClient(client))
            }
            Err(e) if e.raw_os_error() == Some(ERROR_FILE_NOT_FOUND) => {
                let server = ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(&path)
                    .map_err(|e| Error::DeviceUnavailable(format!("{path}: {e}")))?;

                info!(%path, "Waiting for a named pipe peer");

                server.connect().await.map_err(Error::DeviceIo)?;
                info!(%path, "Named pipe peer connected");

                Ok(Device::PipeServer(server))
            }
            Err(e) => Err(Error::DeviceUnavailable(format!("{path}: {e}"))),
        }
    }

    /// Set the DTR line. A real signal on serial ports, a no-op elsewhere.
    pub fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        match self {
            Device::Serial(stream) => stream
                .write_data_terminal_ready(level)
                .map_err(|e| Error::DeviceIo(e.into())),
            Device::Pty(stream) => {
                if let Err(e) = stream.write_data_terminal_ready(level) {
                    warn!(%e, "Ignoring DTR on PTY");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Set the RTS line. A real signal on serial ports, a no-op elsewhere.
    pub fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        match self {
            Device::Serial(stream) => stream
                .write_request_to_send(level)
                .map_err(|e| Error::DeviceIo(e.into())),
            Device::Pty(stream) => {
                if let Err(e) = stream.write_request_to_send(level) {
                    warn!(%e, "Ignoring RTS on PTY");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl AsyncRead for Device {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Device::Serial(s) | Device::Pty(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Device::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Device::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            Device::PipeClient(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            Device::PipeServer(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Device {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Device::Serial(s) | Device::Pty(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Device::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Device::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            Device::PipeClient(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            Device::PipeServer(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Device::Serial(s) | Device::Pty(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Device::Unix(s) => Pin::new(s).poll_flush(cx),
            Device::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            Device::PipeClient(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            Device::PipeServer(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Device::Serial(s) | Device::Pty(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Device::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Device::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            Device::PipeClient(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            Device::PipeServer(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_spec() {
        let spec = DeviceSpec::parse("unix:/tmp/vmodem.sock", 38_400).unwrap();

        assert_eq!(
            spec,
            DeviceSpec::Unix {
                path: "/tmp/vmodem.sock".into()
            }
        );
    }

    #[test]
    fn parses_tcp_spec() {
        let spec = DeviceSpec::parse("tcp:127.0.0.1:9000", 38_400).unwrap();

        assert_eq!(
            spec,
            DeviceSpec::Tcp {
                host: "127.0.0.1".into(),
                port: 9000
            }
        );
    }

    #[test]
    fn tcp_without_port_is_rejected() {
        assert!(DeviceSpec::parse("tcp:127.0.0.1", 38_400).is_err());
        assert!(DeviceSpec::parse("tcp:host:0", 38_400).is_err());
        assert!(DeviceSpec::parse("tcp:host:notaport", 38_400).is_err());
    }

    #[test]
    fn parses_pipe_specs() {
        let short = DeviceSpec::parse("pipe:vmodem", 38_400).unwrap();
        let long = DeviceSpec::parse(r"\\.\pipe\vmodem", 38_400).unwrap();

        assert_eq!(short, DeviceSpec::Pipe { name: "vmodem".into() });
        assert_eq!(short, long);
    }

    #[test]
    fn parses_com_port() {
        let spec = DeviceSpec::parse("COM3", 19_200).unwrap();

        assert_eq!(
            spec,
            DeviceSpec::Serial {
                path: "COM3".into(),
                baud: 19_200
            }
        );
    }

    #[test]
    fn absolute_paths_are_serial_or_pty() {
        let serial = DeviceSpec::parse("/dev/ttyUSB0", 38_400).unwrap();
        let pty = DeviceSpec::parse("/dev/pts/4", 38_400).unwrap();

        assert!(matches!(serial, DeviceSpec::Serial { .. }));
        assert!(matches!(pty, DeviceSpec::Pty { .. }));
    }

    #[test]
    fn garbage_is_misconfigured() {
        let err = DeviceSpec::parse("not-a-device", 38_400).unwrap_err();

        assert!(matches!(err, Error::DeviceMisconfigured(_)));
    }
}
