pub mod config;
pub mod controller;
pub mod devices;
pub mod mqtt;

use crate::config::{BridgeConfig, LoggingConfig};
use crate::controller::announcement::POSITION_OPEN;
use crate::controller::{AnnouncementSet, ControllerHandle, ControllerSettings};
use crate::devices::{DeviceProxy, DeviceRegistry, ProxySettings, SimulatedDriver};
use crate::mqtt::mqtt_handler::{BrokerSession, ConnectionState, SessionError};
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Why the bridge exited unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Error reporting could not be installed
    Setup,
    Config,
    Broker,
}

impl From<Failure> for ExitCode {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Setup => ExitCode::FAILURE,
            Failure::Config => ExitCode::from(2),
            Failure::Broker => ExitCode::from(3),
        }
    }
}

/// Bridges motorized blinds to an MQTT broker with Home Assistant discovery
#[derive(Parser, Debug)]
#[command(name = "blindbridge", version, about)]
struct Cli {
    /// Configuration file (defaults to <config dir>/blindbridge/config.toml)
    #[arg(short, long, env = "BLINDBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit without connecting
    #[arg(long)]
    check: bool,
}

/// Everything built from configuration before the first connection attempt
struct Prepared {
    config: BridgeConfig,
    registry: Arc<DeviceRegistry>,
    announcements: Arc<AnnouncementSet>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(report) = setup() {
        eprintln!("{report:?}");
        return Failure::Setup.into();
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(report) => {
            eprintln!("{report:?}");
            return Failure::Config.into();
        }
    };

    let _log_guard = match setup_logging(&config.logging) {
        Ok(guard) => guard,
        Err(report) => {
            eprintln!("{report:?}");
            return Failure::Config.into();
        }
    };

    let prepared = match prepare(config) {
        Ok(prepared) => prepared,
        Err(report) => {
            error!("{report:?}");
            return Failure::Config.into();
        }
    };

    if cli.check {
        info!(
            "Configuration OK: {} blinds, broker {}:{}",
            prepared.registry.len(),
            prepared.config.mqtt.host,
            prepared.config.mqtt.port
        );
        return ExitCode::SUCCESS;
    }

    match run(prepared).await {
        Ok(()) => {
            info!("Bridge stopped");
            ExitCode::SUCCESS
        }
        Err(report) => {
            error!("{report:?}");
            Failure::Broker.into()
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => BridgeConfig::default_path()
            .ok_or_else(|| eyre!("no configuration directory, pass --config"))?,
    };
    BridgeConfig::load(&path)
        .wrap_err_with(|| format!("invalid configuration in {}", path.display()))
}

/// Console logging plus an optional non-blocking file copy. `RUST_LOG`
/// overrides the configured filter. The returned guard flushes the file on drop.
fn setup_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.filter)
            .wrap_err_with(|| format!("invalid log filter {:?}", logging.filter))?,
    };

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre!("log file {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .wrap_err("failed to install the tracing subscriber")?;
    Ok(guard)
}

fn prepare(config: BridgeConfig) -> Result<Prepared> {
    let registry =
        DeviceRegistry::from_config(&config.blinds).wrap_err("invalid blind configuration")?;
    if registry.is_empty() {
        warn!("No blinds configured, the bridge will only hold the broker connection");
    }
    let announcements =
        AnnouncementSet::build(&registry).wrap_err("could not lay out MQTT topics")?;

    Ok(Prepared {
        config,
        registry: Arc::new(registry),
        announcements: Arc::new(announcements),
    })
}

async fn run(prepared: Prepared) -> Result<()> {
    let Prepared {
        config,
        registry,
        announcements,
    } = prepared;

    // no radio driver is compiled in yet; every configured blind is simulated
    let driver = SimulatedDriver::new();
    for device in registry.all() {
        driver.add_blind(&device.address, POSITION_OPEN);
    }
    info!("Using the simulated driver for {} blinds", registry.len());
    let proxy = DeviceProxy::new(
        Arc::new(driver),
        &registry,
        ProxySettings::from(&config.driver),
    );

    let (session, events, mut session_task) = BrokerSession::spawn(config.mqtt.clone());
    tokio::spawn(log_connection_state(session.watch_state()));
    let controller = ControllerHandle::spawn(
        session.clone(),
        events,
        registry,
        announcements,
        proxy,
        ControllerSettings::from(&config),
    )
    .wrap_err("failed to start the bridge controller")?;

    let session_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            None
        }
        result = &mut session_task => Some(result),
    };

    controller
        .shutdown()
        .await
        .wrap_err("bridge controller did not shut down cleanly")?;

    let session_result = match session_result {
        Some(result) => result,
        None => {
            session.stop();
            session_task.await
        }
    };
    session_outcome(session_result)
}

/// Ends once the session task is gone
async fn log_connection_state(mut state: watch::Receiver<ConnectionState>) {
    let mut last = *state.borrow_and_update();
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        if current != last {
            info!(from = ?last, to = ?current, "Broker connection state changed");
            last = current;
        }
    }
}

fn session_outcome(result: Result<Result<(), SessionError>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ SessionError::RetriesExhausted { .. })) => {
            Err(e).wrap_err("broker unreachable")
        }
        Ok(Err(e)) => Err(e).wrap_err("broker session failed"),
        Err(e) => Err(e).wrap_err("broker session task failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
