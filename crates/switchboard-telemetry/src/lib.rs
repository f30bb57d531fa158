mod diagnostics;
mod logging;

pub use diagnostics::{Counter, Diagnostics, DiagnosticsSnapshot, HistogramSummary};
pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. "info"). Overridden by RUST_LOG.
    pub log_level: String,
    /// Per-module overrides (e.g. "switchboard_engine" => "debug").
    pub module_levels: Vec<(String, String)>,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: home_dir().join("logs.db"),
            json: true,
        }
    }
}

/// Keeps the log sink and diagnostics alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    diagnostics: Arc<Diagnostics>,
}

impl TelemetryGuard {
    /// The persisted warn+ log, when SQLite logging is enabled.
    pub fn log_sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diagnostics)
    }
}

/// Initialize tracing. Call once at startup; later calls keep the first
/// subscriber and only return a fresh guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

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
                eprintln!("switchboard-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
        .is_err()
    {
        eprintln!("switchboard-telemetry: subscriber already installed");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
        diagnostics: Arc::new(Diagnostics::new()),
    }
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    filter
}

/// `~/.switchboard`, falling back to /tmp when HOME is unset.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".switchboard")
}
