//! ---
//! fl_section: "04-observability"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Metrics collection and export utilities."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server exposing the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || scrape_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn scrape_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address of the exporter.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metric families published by the experiment orchestrator.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: SharedRegistry,
    experiments_registered: IntGauge,
    executions_running: IntGauge,
    executions_finished_total: IntCounterVec,
    rollbacks_total: IntCounterVec,
    execution_duration_seconds: Histogram,
    events_published_total: IntCounterVec,
}

impl OrchestratorMetrics {
    /// Register the orchestration metric family against the registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let experiments_registered = IntGauge::with_opts(Opts::new(
            "faultline_experiments_registered",
            "Number of experiment definitions currently registered",
        ))?;
        registry.register(Box::new(experiments_registered.clone()))?;

        let executions_running = IntGauge::with_opts(Opts::new(
            "faultline_executions_running",
            "Number of executions currently in the running state",
        ))?;
        registry.register(Box::new(executions_running.clone()))?;

        let executions_finished_total = IntCounterVec::new(
            Opts::new(
                "faultline_executions_finished_total",
                "Executions reaching a terminal state, by status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(executions_finished_total.clone()))?;

        let rollbacks_total = IntCounterVec::new(
            Opts::new(
                "faultline_rollbacks_total",
                "Rollback-trigger firings, by breached metric",
            ),
            &["metric"],
        )?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let execution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "faultline_execution_duration_seconds",
                "Wall-clock duration of finished executions",
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 14)?),
        )?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new(
                "faultline_events_published_total",
                "Lifecycle events published on the bus, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        Ok(Self {
            registry,
            experiments_registered,
            executions_running,
            executions_finished_total,
            rollbacks_total,
            execution_duration_seconds,
            events_published_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Track the registered-experiment gauge.
    pub fn set_experiment_count(&self, count: usize) {
        self.experiments_registered.set(count as i64);
    }

    /// An execution entered `running`.
    pub fn execution_started(&self) {
        self.executions_running.inc();
    }

    /// An execution that was running reached a terminal state.
    pub fn execution_finished(&self, status: &str, duration: Option<Duration>) {
        self.executions_running.dec();
        self.executions_finished_total
            .with_label_values(&[status])
            .inc();
        if let Some(duration) = duration {
            self.execution_duration_seconds
                .observe(duration.as_secs_f64());
        }
    }

    /// An execution failed before ever entering `running`.
    pub fn execution_aborted(&self, status: &str) {
        self.executions_finished_total
            .with_label_values(&[status])
            .inc();
    }

    /// A rollback trigger fired for the named metric.
    pub fn record_rollback(&self, metric: &str) {
        self.rollbacks_total.with_label_values(&[metric]).inc();
    }

    /// A lifecycle event was published.
    pub fn inc_event(&self, kind: &str) {
        self.events_published_total.with_label_values(&[kind]).inc();
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
