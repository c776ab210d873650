use std::path::PathBuf;

use clap::Parser;

/// The command line interface for the bridge.
///
/// Everything here overrides the corresponding configuration file field.
#[derive(Debug, Default, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Local device specifier (path, COMx, unix:.., tcp:.., pipe:..)
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Baud rate for serial devices
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,

    /// Emulate a Hayes modem on the local device
    #[arg(short = 'e', long)]
    pub emulate_modem: bool,

    /// Username for the remote server
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password for the remote server
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Verbose (debug level) logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Connection retry budget
    #[arg(short = 'r', long)]
    pub retries: Option<u32>,

    /// Inactivity timeout in seconds, 0 to disable
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Log file path
    #[arg(long)]
    pub log: Option<PathBuf>,
}
