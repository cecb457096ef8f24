use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser};
use pfod_transport::{HttpTransport, TransportError};
use pfod_viewer_core::config::{parse_target, Config, ConfigError};
use pfod_viewer_core::engine::Engine;
use pfod_viewer_core::error::SyncError;
use pfod_viewer_core::sync::SyncCore;
use pfod_viewer_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use pfod_viewer_core::view::LogSink;
use thiserror::Error;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.connection.apply(Config::from_env()?)?;
    let http = config.http_config()?;
    info!(
        device = %http.base_url,
        timeout_ms = http.response_timeout.as_millis() as u64,
        max_retries = http.max_retries,
        "connecting"
    );
    let transport = HttpTransport::new(http)?;

    let core = SyncCore::new(config.identifier.clone());
    let (engine, handle) = Engine::new(core, Arc::new(transport), Box::new(LogSink));
    match &config.initial_drawing {
        Some(name) => handle.open_drawing(name.as_str())?,
        None => handle.connect()?,
    }
    let task = tokio::spawn(engine.run());

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    handle.shutdown()?;
    let core = task
        .await
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    debug!(
        drawings = ?core.visible().drawings().list_drawings(),
        mode = ?core.visible().mode(),
        "final state"
    );
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "pfod-viewer",
    about = "Headless viewer for pfod devices serving interactive drawings",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct ConnectionArgs {
    #[arg(
        value_name = "DEVICE",
        help = "Device address or URL (overrides PFOD_TARGET)"
    )]
    target: Option<String>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Seconds to wait for each response, 0 to wait a minute (max 30)"
    )]
    timeout: Option<u64>,

    #[arg(long, value_name = "N", help = "Retries after a failed request")]
    retries: Option<u32>,

    #[arg(long, value_name = "ID", help = "Touch identifier until a menu supplies one")]
    identifier: Option<String>,

    #[arg(
        long,
        value_name = "NAME",
        help = "Open this drawing directly instead of the main menu"
    )]
    drawing: Option<String>,
}

impl ConnectionArgs {
    fn apply(&self, mut config: Config) -> Result<Config, ConfigError> {
        if let Some(target) = &self.target {
            config.target = parse_target(target)?.to_string();
        }
        if let Some(secs) = self.timeout {
            config.response_timeout_secs = secs;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(identifier) = &self.identifier {
            config.identifier = identifier.clone();
        }
        if let Some(drawing) = &self.drawing {
            config.initial_drawing = Some(drawing.clone());
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PFOD_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PFOD_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("viewer task failed: {0}")]
    Runtime(String),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}
