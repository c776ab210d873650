use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{cli::Cli, error::Error};

/// The config file consulted when `-c` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "bridge-config.json";

fn default_server_port() -> u16 {
    6060
}

fn default_baud_rate() -> u32 {
    38_400
}

fn default_connect_speed() -> u32 {
    33_600
}

fn default_emulate_modem() -> bool {
    true
}

fn default_inactivity_timeout() -> u64 {
    300
}

fn default_connection_retries() -> u32 {
    3
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("crossbridge.log"))
}

/// The configuration used for running the bridge.
///
/// Immutable once loaded; command line arguments are merged in before
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Username presented during the login handshake.
    #[serde(default)]
    pub username: String,

    /// Password presented during the login handshake.
    #[serde(default)]
    pub password: String,

    /// Host of the remote PPP server.
    #[serde(default)]
    pub server_host: String,

    /// Port of the remote PPP server.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Local device specifier. See [`crate::device::DeviceSpec`].
    #[serde(default)]
    pub device: String,

    /// Baud rate, only meaningful for serial devices.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// The speed reported in the `CONNECT` result code.
    #[serde(default = "default_connect_speed")]
    pub connect_speed: u32,

    /// Whether to run the Hayes modem emulation on the local device.
    #[serde(default = "default_emulate_modem")]
    pub emulate_modem: bool,

    /// Seconds without traffic before the session is dropped. 0 disables.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,

    /// How many times to retry connecting before giving up.
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,

    /// Debug level logging.
    #[serde(default)]
    pub debug: bool,

    /// Where to write the log file. `None` logs to stdout only.
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            server_host: String::new(),
            server_port: default_server_port(),
            device: String::new(),
            baud_rate: default_baud_rate(),
            connect_speed: default_connect_speed(),
            emulate_modem: default_emulate_modem(),
            inactivity_timeout: default_inactivity_timeout(),
            connection_retries: default_connection_retries(),
            debug: false,
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// Deserialize a JSON config file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        serde_json::from_str(input).map_err(|e| Error::ConfigInvalid(format!("Bad JSON: {e}")))
    }

    /// Setup a new configuration from a JSON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::ConfigInvalid(format!("Could not read {}: {e}", p.display())))?;

        Self::deserialize(&s)
    }

    /// Load the effective configuration: the file named on the command
    /// line (or [`DEFAULT_CONFIG_PATH`] if present), overridden by the
    /// rest of the command line, then validated.
    pub fn load(cli: &Cli) -> Result<Self, Error> {
        let mut config = match &cli.config {
            Some(path) => Self::new_from_path(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::new_from_path(DEFAULT_CONFIG_PATH)?
            }
            None => Self::default(),
        };

        config.apply_cli(cli);
        config.validate()?;

        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(device) = &cli.device {
            self.device = device.clone();
        }
        if let Some(baud) = cli.baud {
            self.baud_rate = baud;
        }
        if cli.emulate_modem {
            self.emulate_modem = true;
        }
        if let Some(username) = &cli.username {
            self.username = username.clone();
        }
        if let Some(password) = &cli.password {
            self.password = password.clone();
        }
        if cli.verbose {
            self.debug = true;
        }
        if let Some(retries) = cli.retries {
            self.connection_retries = retries;
        }
        if let Some(timeout) = cli.timeout {
            self.inactivity_timeout = timeout;
        }
        if let Some(log) = &cli.log {
            self.log_file = Some(log.clone());
        }
    }

    /// Check that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), Error> {
        if self.username.is_empty() {
            return Err(Error::ConfigInvalid("`username` is required".into()));
        }
        if self.password.is_empty() {
            return Err(Error::ConfigInvalid("`password` is required".into()));
        }
        if self.server_host.is_empty() {
            return Err(Error::ConfigInvalid("`server_host` is required".into()));
        }
        if self.server_port == 0 {
            return Err(Error::ConfigInvalid("`server_port` must be 1-65535".into()));
        }
        if self.device.is_empty() {
            return Err(Error::ConfigInvalid("`device` is required".into()));
        }

        Ok(())
    }

    /// The remote endpoint as a `host:port` string.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// The inactivity window, or `None` when disabled.
    pub fn inactivity(&self) -> Option<Duration> {
        (self.inactivity_timeout > 0).then(|| Duration::from_secs(self.inactivity_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            username: "u".into(),
            password: "p".into(),
            server_host: "h".into(),
            device: "tcp:127.0.0.1:9000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn deserialize_fills_defaults() {
        let input = r#"
{
    "username": "alice",
    "password": "hunter2",
    "server_host": "ppp.example.net",
    "device": "/dev/ttyUSB0"
}
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.server_port, 6060);
        assert_eq!(config.baud_rate, 38_400);
        assert_eq!(config.connect_speed, 33_600);
        assert!(config.emulate_modem);
        assert_eq!(config.connection_retries, 3);
        assert_eq!(config.inactivity_timeout, 300);
    }

    #[test]
    fn bad_json_is_config_invalid() {
        let err = Config::deserialize("{ nope").unwrap_err();

        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let mut config = valid();
        config.username.clear();

        assert!(config.validate().is_err());

        let mut config = valid();
        config.password.clear();

        assert!(config.validate().is_err());
    }

    #[test]
    fn port_zero_fails_validation() {
        let mut config = valid();
        config.server_port = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_overrides_file_values() {
        let mut config = valid();
        let cli = Cli {
            device: Some("/dev/ttyS1".into()),
            baud: Some(9600),
            retries: Some(0),
            timeout: Some(5),
            verbose: true,
            ..Default::default()
        };

        config.apply_cli(&cli);

        assert_eq!(config.device, "/dev/ttyS1");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.connection_retries, 0);
        assert_eq!(config.inactivity_timeout, 5);
        assert!(config.debug);
    }

    #[test]
    fn zero_inactivity_disables_the_timer() {
        let mut config = valid();
        config.inactivity_timeout = 0;

        assert_eq!(config.inactivity(), None);

        config.inactivity_timeout = 5;

        assert_eq!(config.inactivity(), Some(Duration::from_secs(5)));
    }
}
