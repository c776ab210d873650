use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{info, metadata::LevelFilter, trace, Level};
use tracing_subscriber::{prelude::*, EnvFilter};

fn do_init(stdout_level: Level, log_file: Option<PathBuf>) {
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| stdout_level.to_string()),
    ));

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = log_file.map(|path| {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "crossbridge.log".into());

        let file_appender = tracing_appender::rolling::never(dir, file_name);

        tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_filter(LevelFilter::from(stdout_level))
    });

    registry.with(maybe_file_layer).init();
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, log_file: Option<PathBuf>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, log_file);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Flush anything not logged yet.
pub fn shutdown() {
    trace!("Shutting down");
}
