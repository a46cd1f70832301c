use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use parlor_server::{AppState, ServerConfig};
use parlor_store::Database;
use parlor_telemetry::{default_data_dir, init_telemetry, TelemetryConfig};
use tracing::Level;

/// Room-based real-time chat broker.
#[derive(Parser, Debug)]
#[command(name = "parlor", version, about)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "PARLOR_HOST")]
    host: Option<String>,

    /// Port to listen on (0 picks a free one).
    #[arg(short, long, env = "PARLOR_PORT")]
    port: Option<u16>,

    /// SQLite database file. Defaults to <data-dir>/parlor.db.
    #[arg(long, env = "PARLOR_DB")]
    db: Option<PathBuf>,

    /// Directory for the database and the log store.
    #[arg(long, env = "PARLOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// trace, debug, info, warn or error. RUST_LOG takes precedence.
    #[arg(long, env = "PARLOR_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// JSON file with server settings; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    plain_logs: bool,

    /// Let SET_USER claim user ids the store has never seen.
    #[arg(long)]
    allow_unknown_users: bool,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.allow_unknown_users {
            config.require_known_users = false;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: !cli.plain_logs,
        ..TelemetryConfig::with_data_dir(&data_dir)
    });

    let config = cli.server_config()?;

    let db_path = cli.db.clone().unwrap_or_else(|| data_dir.join("parlor.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let state = AppState::new(config, db).with_logs(telemetry.sink());
    let handle = parlor_server::start_with_state(state)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "parlor ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
