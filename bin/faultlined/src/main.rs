//! ---
//! fl_section: "05-daemon"
//! fl_subsection: "binary"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Binary entrypoint for the Faultline daemon."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

use faultline_bus::{spawn_alert_forwarder, EventBus, LogAlertingSink};
use faultline_common::config::AppConfig;
use faultline_common::logging::init_tracing;
use faultline_engine::{
    ChaosOrchestrator, DriverRegistry, EngineSettings, SimulatedGateway,
};
use faultline_metrics::{new_registry, spawn_http_server, OrchestratorMetrics};
use faultline_store::ExperimentStore;
use faultline_types::ExperimentDefinition;

const SERVICE_NAME: &str = "faultlined";
const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["faultline.toml", "configs/faultline.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Faultline fault-injection orchestrator daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the configuration and experiment definition files, then exit.
    Validate,
}

/// On-disk shape of an experiment definition file.
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    experiments: Vec<ExperimentDefinition>,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load(std::slice::from_ref(path)),
        None => AppConfig::load(&DEFAULT_CONFIG_CANDIDATES),
    }
}

fn load_definitions(config: &AppConfig) -> Result<Vec<ExperimentDefinition>> {
    let mut definitions = Vec::new();
    for path in &config.definitions {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read definition file {}", path.display()))?;
        let file: DefinitionFile = toml::from_str(&contents)
            .with_context(|| format!("failed to parse definition file {}", path.display()))?;
        info!(
            path = %path.display(),
            experiments = file.experiments.len(),
            "definition file loaded",
        );
        definitions.extend(file.experiments);
    }
    Ok(definitions)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(SERVICE_NAME, &config.logging)?;

    if let Some(Commands::Validate) = cli.command {
        let definitions = load_definitions(&config)?;
        info!(
            definitions = definitions.len(),
            metrics_enabled = config.metrics.enabled,
            "configuration valid",
        );
        return Ok(());
    }

    let registry = new_registry();
    let metrics = OrchestratorMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        None
    };

    let bus = EventBus::new(config.engine.event_capacity);
    let alert_task = spawn_alert_forwarder(&bus, Arc::new(LogAlertingSink));

    let store = Arc::new(ExperimentStore::new());
    let orchestrator = ChaosOrchestrator::new(
        store,
        Arc::new(DriverRegistry::with_simulated_defaults()),
        Arc::new(SimulatedGateway::new()),
        bus,
        Some(metrics),
        EngineSettings {
            sample_interval: config.engine.sample_interval,
            monitor_interval: config.engine.monitor_interval,
        },
    );

    for definition in load_definitions(&config)? {
        let experiment = orchestrator.create_experiment(definition);
        info!(
            experiment = %experiment.id,
            name = %experiment.name,
            kind = experiment.kind.as_str(),
            scheduled = experiment.schedulable(),
            "experiment registered from definitions",
        );
    }

    info!(
        experiments = orchestrator.list_experiments().len(),
        "faultlined started",
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.scheduler().shutdown();
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics server shutdown error");
        }
    }
    alert_task.abort();
    info!("faultlined stopped");
    Ok(())
}

/// Graceful shutdown helper shared across workspace binaries.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = terminate => {},
    }
}
