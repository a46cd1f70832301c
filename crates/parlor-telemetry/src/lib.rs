mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parlor_broker" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout instead of the human-readable format.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::with_data_dir(&default_data_dir())
    }
}

impl TelemetryConfig {
    pub fn with_data_dir(dir: &Path) -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: dir.join("logs.db"),
        }
    }

    fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink reachable for queries after init.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Shared handle to the sink, for serving queries from another task.
    pub fn sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call (common in tests) leaves the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("parlor-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("parlor-telemetry: subscriber already set: {e}");
    }

    TelemetryGuard { log_sink: sqlite_sink }
}

/// `$HOME/.parlor`, or `/tmp/.parlor` without a home directory.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parlor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            module_levels: vec![
                ("parlor_broker".into(), Level::DEBUG),
                ("tower_http".into(), Level::WARN),
            ],
            ..TelemetryConfig::with_data_dir(Path::new("/tmp/parlor-test"))
        };
        assert_eq!(
            config.filter_directives(),
            "info,parlor_broker=debug,tower_http=warn"
        );
    }

    #[test]
    fn data_dir_controls_log_path() {
        let config = TelemetryConfig::with_data_dir(Path::new("/var/lib/parlor"));
        assert_eq!(config.log_db_path, PathBuf::from("/var/lib/parlor/logs.db"));
    }

    #[test]
    fn init_without_sqlite_has_no_sink() {
        let config = TelemetryConfig {
            log_to_sqlite: false,
            ..TelemetryConfig::with_data_dir(Path::new("/tmp/parlor-test"))
        };
        let guard = init_telemetry(config);
        assert!(guard.logs().is_none());
        assert!(guard.sink().is_none());
    }
}
