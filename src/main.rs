use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use vesper_bridge::{
    cli::Cli,
    config::Config,
    device::{Device, DeviceSpec},
    error::Error,
    logging,
    session::{Outcome, Supervisor},
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit codes promised to callers.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_DEVICE: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_RETRIES: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

fn exit_code_for(e: &Error) -> u8 {
    match e {
        Error::ConfigInvalid(_) => EXIT_CONFIG,
        Error::DeviceUnavailable(_) | Error::DeviceMisconfigured(_) | Error::DeviceIo(_) => {
            EXIT_DEVICE
        }
        Error::AuthFailed(_) => EXIT_AUTH,
        Error::RemoteUnreachable { .. } | Error::HandshakeTimeout | Error::HandshakeRejected(_) => {
            EXIT_RETRIES
        }
        Error::Cancelled => EXIT_INTERRUPTED,
        Error::InactivityTimeout | Error::CarrierLost => EXIT_OK,
    }
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                signal(SignalKind::terminate()).expect("Signal handler registration should work");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C, shutting down"),
                _ = terminate.recv() => info!("Told to terminate, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C, shutting down");
        }

        cancel.cancel();
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("{e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    logging::init(level, config.log_file.clone()).await;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Vesper PPP bridge starting"
    );

    let code = run(config).await;

    logging::shutdown();

    ExitCode::from(code)
}

async fn run(config: Config) -> u8 {
    let spec = match DeviceSpec::parse(&config.device, config.baud_rate) {
        Ok(spec) => spec,
        Err(e) => {
            error!(%e, "Bad device specifier");
            return EXIT_DEVICE;
        }
    };

    let device = match Device::open(&spec).await {
        Ok(device) => device,
        Err(e) => {
            error!(%e, "Could not open device");
            return EXIT_DEVICE;
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let supervisor = Supervisor::new(config, device, cancel);

    match supervisor.run().await {
        Ok(Outcome::Clean) => {
            info!("Bridge finished");
            EXIT_OK
        }
        Ok(Outcome::Interrupted) => {
            info!("Bridge interrupted");
            EXIT_INTERRUPTED
        }
        Err(e) => {
            error!(%e, "Bridge failed");
            exit_code_for(&e)
        }
    }
}
