use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use secrecy::SecretString;

use switchboard_core::config::IsolationStrategy;
use switchboard_core::engine::{AmbientRuntime, ExecutionEngine};
use switchboard_engine::naming::{Namer, NamingScheduler};
use switchboard_engine::{BaselineStore, ConfigurationIsolator, Orchestrator, OrchestratorConfig};
use switchboard_runtime::{HttpEngine, HttpSummarizer, SharedRuntime};
use switchboard_settings::SwitchboardSettings;
use switchboard_store::Database;
use switchboard_telemetry::TelemetryConfig;

/// Per-request orchestration front end for a multi-agent execution engine.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version)]
struct Cli {
    /// Settings file (defaults to ~/.switchboard/settings.json).
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// SQLite database for sessions, turns, memories and the audit log.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    engine_url: Option<String>,

    /// `merge` or `leased`.
    #[arg(long)]
    isolation: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut SwitchboardSettings) -> anyhow::Result<()> {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.storage.db_path = db.clone();
        }
        if let Some(url) = &self.engine_url {
            settings.engine.url = url.clone();
        }
        if let Some(isolation) = &self.isolation {
            settings.orchestration.isolation = isolation.parse::<IsolationStrategy>().map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => switchboard_settings::load_settings_from_path(path),
        None => switchboard_settings::load_settings(),
    }
    .context("failed to load settings")?;
    cli.apply(&mut settings)?;

    let telemetry = switchboard_telemetry::init_telemetry(TelemetryConfig {
        log_level: settings.telemetry.log_level.clone(),
        module_levels: settings.telemetry.module_levels.clone().into_iter().collect(),
        log_to_sqlite: settings.telemetry.log_to_sqlite,
        log_db_path: settings.telemetry.log_db_path.clone(),
        json: settings.telemetry.json,
    });
    let diagnostics = telemetry.diagnostics();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting switchboard");

    let db = Database::open(&settings.storage.db_path)
        .with_context(|| format!("failed to open database at {}", settings.storage.db_path.display()))?;

    let api_key = std::env::var(&settings.engine.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .map(SecretString::from);
    let http_engine = HttpEngine::new(
        settings.engine.url.clone(),
        api_key,
        Duration::from_secs(settings.engine.connect_timeout_secs),
        Duration::from_secs(settings.engine.idle_timeout_secs),
    )?;

    let baseline = settings.baseline.to_baseline();
    let store = Arc::new(BaselineStore::new(baseline.clone()));
    let (engine, isolator): (Arc<dyn ExecutionEngine>, ConfigurationIsolator) = match settings.orchestration.isolation {
        IsolationStrategy::Merge => (
            Arc::new(http_engine),
            ConfigurationIsolator::merge(store, Arc::clone(&diagnostics)),
        ),
        IsolationStrategy::Leased => {
            let runtime: Arc<dyn AmbientRuntime> = Arc::new(SharedRuntime::new(baseline.to_configuration()));
            (
                Arc::new(http_engine.with_ambient(Arc::clone(&runtime))),
                ConfigurationIsolator::leased(store, runtime, Arc::clone(&diagnostics)),
            )
        }
    };
    tracing::info!(
        engine_url = %settings.engine.url,
        isolation = isolator.strategy_name(),
        "execution engine configured"
    );

    let naming = match &settings.summarizer.url {
        Some(url) => {
            let summarizer = HttpSummarizer::new(url.clone(), Duration::from_secs(settings.summarizer.timeout_secs))?;
            let namer = Namer::new(db.clone(), Arc::new(summarizer), Arc::clone(&diagnostics));
            Some(NamingScheduler::spawn(namer))
        }
        None => {
            tracing::info!("no summarizer configured, session naming disabled");
            None
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        Arc::new(isolator),
        db,
        naming,
        settings.catalog.clone(),
        diagnostics,
        OrchestratorConfig::from(&settings.orchestration),
    ));

    let config = switchboard_server::ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        keep_alive: Duration::from_secs(settings.server.keep_alive_secs),
        cors_allow_any: settings.server.cors_allow_any,
        ..Default::default()
    };
    let handle = switchboard_server::start(config, orchestrator, telemetry.log_sink())
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.addr, "switchboard ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    handle.shutdown().await;
    Ok(())
}
