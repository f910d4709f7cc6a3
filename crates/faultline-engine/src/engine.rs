//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Per-execution state machine and lifecycle management."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use faultline_bus::EventBus;
use faultline_metrics::OrchestratorMetrics;
use faultline_store::{ExperimentStore, StoreError};
use faultline_types::{EventPayload, Execution, ExecutionStatus, Experiment};

use crate::drivers::{DriverRegistry, UndoFn};
use crate::gateway::MetricsGateway;
use crate::impact;
use crate::monitor::RollbackMonitor;

/// Reason recorded when an operator stops a run.
pub const MANUAL_STOP_REASON: &str = "manual_stop";

/// Tuning knobs for the per-execution background loops.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Interval between in-flight metric samples.
    pub sample_interval: Duration,
    /// Interval between rollback-trigger evaluations.
    pub monitor_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// Errors surfaced to callers of the engine's operator surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The referenced experiment or execution does not exist.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Scheduled-only experiment; manual runs must pass `immediate`.
    #[error("experiment {0} is disabled; manual runs require immediate")]
    ExperimentDisabled(Uuid),
    /// The execution is not in a stoppable state.
    #[error("execution {id} is {status}, expected running")]
    NotRunning {
        /// Execution identifier.
        id: Uuid,
        /// Status the execution was actually in.
        status: ExecutionStatus,
    },
}

/// Why a run left its duration wait early.
#[derive(Debug, Clone)]
pub(crate) enum StopCause {
    /// Operator requested a stop.
    Manual {
        /// Reason recorded on the execution.
        reason: String,
    },
    /// A rollback trigger breached.
    Trigger {
        /// Metric that breached, for the rollback counter.
        metric: String,
        /// Reason recorded on the execution.
        reason: String,
    },
}

/// Handle returned by [`ExecutionEngine::execute`]. The run proceeds on its
/// own task; joining is optional.
#[derive(Debug)]
pub struct ExecutionHandle {
    /// Identifier of the created execution record.
    pub execution_id: Uuid,
    task: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Await run completion. The terminal record is in the store afterwards.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!(execution = %self.execution_id, error = %err, "execution task join error");
        }
    }
}

struct EngineInner {
    store: Arc<ExperimentStore>,
    drivers: Arc<DriverRegistry>,
    gateway: Arc<dyn MetricsGateway>,
    bus: EventBus,
    metrics: Option<OrchestratorMetrics>,
    settings: EngineSettings,
    stops: Mutex<HashMap<Uuid, mpsc::Sender<StopCause>>>,
}

/// Drives executions through `pending -> running -> terminal`, owning the
/// undo action, the in-flight sampler, and the rollback monitor for each run.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Assemble an engine over its collaborators.
    pub fn new(
        store: Arc<ExperimentStore>,
        drivers: Arc<DriverRegistry>,
        gateway: Arc<dyn MetricsGateway>,
        bus: EventBus,
        metrics: Option<OrchestratorMetrics>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                drivers,
                gateway,
                bus,
                metrics,
                settings,
                stops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start one run of an experiment. Disabled experiments are rejected
    /// unless `immediate` is set (manual override). The run proceeds on its
    /// own task; the returned handle carries the new execution id.
    pub fn execute(
        &self,
        experiment_id: Uuid,
        immediate: bool,
    ) -> Result<ExecutionHandle, EngineError> {
        let experiment = self.inner.store.get_experiment(experiment_id)?;
        if !experiment.enabled && !immediate {
            return Err(EngineError::ExperimentDisabled(experiment_id));
        }

        let execution = Execution::pending(experiment_id);
        let execution_id = execution.id;
        self.inner.store.insert_execution(execution);
        debug!(execution = %execution_id, experiment = %experiment_id, "execution created");

        let engine = self.clone();
        let task = tokio::spawn(async move {
            engine.run(experiment, execution_id).await;
        });
        Ok(ExecutionHandle { execution_id, task })
    }

    /// Request a manual stop of a running execution. The run ends
    /// `terminated` with reason `manual_stop` after its undo action ran.
    /// Errors (and mutates nothing) unless the execution is running.
    pub fn stop_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let execution = self.inner.store.get_execution(execution_id)?;
        if execution.status != ExecutionStatus::Running {
            return Err(EngineError::NotRunning {
                id: execution_id,
                status: execution.status,
            });
        }
        let sender = self.inner.stops.lock().get(&execution_id).cloned();
        let Some(sender) = sender else {
            return Err(EngineError::NotRunning {
                id: execution_id,
                status: execution.status,
            });
        };
        match sender.try_send(StopCause::Manual {
            reason: MANUAL_STOP_REASON.to_owned(),
        }) {
            // A full channel means a stop cause is already queued.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::NotRunning {
                id: execution_id,
                status: execution.status,
            }),
        }
    }

    /// Stop every running execution of an experiment. Used when a definition
    /// is deleted. Returns how many stop requests were accepted.
    pub fn stop_all_for_experiment(&self, experiment_id: Uuid) -> usize {
        self.inner
            .store
            .running_execution_ids(experiment_id)
            .into_iter()
            .filter(|execution_id| self.stop_execution(*execution_id).is_ok())
            .count()
    }

    pub(crate) fn metrics(&self) -> Option<&OrchestratorMetrics> {
        self.inner.metrics.as_ref()
    }

    /// Publish a lifecycle event and bump its counter.
    pub(crate) fn publish(&self, payload: EventPayload) {
        let event = self.inner.bus.publish(payload);
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_event(event.kind());
        }
    }

    async fn run(&self, experiment: Experiment, execution_id: Uuid) {
        let outcome = self.drive(&experiment, execution_id).await;
        self.inner.stops.lock().remove(&execution_id);

        // Whatever went wrong above, the record must reach a terminal state.
        let Err(err) = outcome else { return };
        error!(execution = %execution_id, error = %err, "execution aborted by unhandled error");
        let mut forced = false;
        let update = self.inner.store.update_execution(execution_id, |execution| {
            if !execution.status.is_terminal() {
                execution
                    .metadata
                    .insert("failure_reason".to_owned(), err.to_string());
                execution.finish(ExecutionStatus::Failed, Utc::now());
                forced = true;
            }
        });
        match update {
            Ok(execution) if forced => {
                self.finish_accounting(&execution, ExecutionStatus::Failed);
            }
            Ok(_) => {}
            Err(store_err) => {
                error!(execution = %execution_id, error = %store_err, "failed to record terminal status");
            }
        }
    }

    /// The state machine proper. Early-return paths record their own
    /// terminal state; `Err` is reserved for store-level surprises handled
    /// defensively by [`run`].
    async fn drive(&self, experiment: &Experiment, execution_id: Uuid) -> Result<()> {
        let inner = &*self.inner;

        // Pre-execution checks. Failure aborts before `running`, with no
        // driver invocation.
        if let Err(reason) = self.preflight(experiment) {
            warn!(
                execution = %execution_id,
                experiment = %experiment.id,
                reason = %reason,
                "pre-execution checks failed",
            );
            self.abort_pending(execution_id, &reason)?;
            return Ok(());
        }

        // Baseline capture, strictly before driver invocation. An
        // unreachable target also aborts before `running`.
        let baseline = match inner.gateway.snapshot(&experiment.target).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(execution = %execution_id, error = %err, "baseline capture failed");
                self.abort_pending(execution_id, &format!("target unreachable: {err}"))?;
                return Ok(());
            }
        };
        inner.store.update_execution(execution_id, |execution| {
            execution.results.metrics_before = Some(baseline);
        })?;

        // Stop channel goes live before the run becomes stoppable.
        let (stop_tx, mut stop_rx) = mpsc::channel(4);
        inner.stops.lock().insert(execution_id, stop_tx.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = RollbackMonitor::new(
            experiment,
            execution_id,
            inner.gateway.clone(),
            inner.settings.monitor_interval,
        );
        let monitor_task = tokio::spawn(monitor.run(stop_tx, shutdown_rx.clone()));

        let started_at = Utc::now();
        inner
            .store
            .update_execution(execution_id, |execution| execution.mark_running(started_at))?;
        if let Some(metrics) = &inner.metrics {
            metrics.execution_started();
        }
        self.publish(EventPayload::ExecutionStarted {
            execution_id,
            experiment_id: experiment.id,
        });
        info!(
            execution = %execution_id,
            experiment = %experiment.id,
            kind = experiment.kind.as_str(),
            fault_target = %experiment.target,
            duration_ms = experiment.parameters.duration.as_millis() as u64,
            "execution running",
        );

        // Driver invocation. The undo action is exclusively owned by this
        // task and invoked at most once.
        let injected: Result<UndoFn> = match inner.drivers.resolve(experiment.kind) {
            Some(driver) => driver.inject(experiment).await,
            None => Err(anyhow!(
                "no driver registered for chaos kind {}",
                experiment.kind
            )),
        };
        let mut undo = match injected {
            Ok(undo) => Some(undo),
            Err(err) => {
                warn!(execution = %execution_id, error = %err, "driver invocation failed");
                let _ = shutdown_tx.send(true);
                let _ = monitor_task.await;
                let finished = inner.store.update_execution(execution_id, |execution| {
                    execution.metadata.insert(
                        "failure_reason".to_owned(),
                        format!("driver invocation failed: {err}"),
                    );
                    execution.finish(ExecutionStatus::Failed, Utc::now());
                })?;
                self.finish_accounting(&finished, ExecutionStatus::Failed);
                return Ok(());
            }
        };

        let sampler_task =
            self.spawn_sampler(execution_id, experiment.target.clone(), shutdown_rx);

        // First of: configured duration, rollback signal, manual stop.
        let cause = tokio::select! {
            _ = tokio::time::sleep(experiment.parameters.duration) => None,
            cause = stop_rx.recv() => cause,
        };

        let _ = shutdown_tx.send(true);
        let _ = monitor_task.await;
        let _ = sampler_task.await;

        // Record the early-stop bookkeeping before the undo runs so pollers
        // see the rollback reason as soon as it is known.
        if let Some(cause) = &cause {
            let reason = match cause {
                StopCause::Trigger { reason, .. } | StopCause::Manual { reason } => reason.clone(),
            };
            let _ = inner.store.update_execution(execution_id, |execution| {
                execution.rollback_triggered = true;
                execution.rollback_reason = Some(reason.clone());
            });
            if let StopCause::Trigger { metric, reason } = cause {
                if let Some(metrics) = &inner.metrics {
                    metrics.record_rollback(metric);
                }
                self.publish(EventPayload::RollbackTriggered {
                    execution_id,
                    experiment_id: experiment.id,
                    reason: reason.clone(),
                });
            }
        }

        // Undo exactly once, on every path through here.
        let undo_error = match undo.take() {
            Some(undo) => undo().await.err(),
            None => None,
        };
        if let Some(err) = &undo_error {
            warn!(execution = %execution_id, error = %err, "undo action failed");
        }

        // Post metrics, strictly after the undo action completed.
        let after = match inner.gateway.snapshot(&experiment.target).await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(execution = %execution_id, error = %err, "post-run metrics capture failed");
                None
            }
        };

        let ended_at = Utc::now();
        let recovery = (ended_at - started_at).to_std().unwrap_or_default();
        let status = match (&cause, &undo_error, &after) {
            (_, Some(_), _) | (_, None, None) => ExecutionStatus::Failed,
            (None, None, Some(_)) => ExecutionStatus::Completed,
            (Some(StopCause::Trigger { .. }), None, Some(_)) => ExecutionStatus::RolledBack,
            (Some(StopCause::Manual { .. }), None, Some(_)) => ExecutionStatus::Terminated,
        };

        let blast_radius = impact::derive_blast_radius(experiment);
        let finished = inner.store.update_execution(execution_id, |execution| {
            if let Some(err) = &undo_error {
                execution
                    .metadata
                    .insert("undo_error".to_owned(), err.to_string());
            }
            if after.is_none() {
                execution.metadata.insert(
                    "failure_reason".to_owned(),
                    "post-run metrics capture failed".to_owned(),
                );
            }
            if let Some(after) = after.clone() {
                if let Some(before) = execution.results.metrics_before.clone() {
                    let analysis =
                        impact::analyze(&before, &after, recovery, blast_radius.clone());
                    execution.results.lessons_learned =
                        impact::lessons_learned(&analysis, execution.rollback_triggered);
                    execution.results.impact = Some(analysis);
                }
                execution.results.metrics_after = Some(after);
            }
            execution.finish(status, ended_at);
        })?;

        self.finish_accounting(&finished, status);
        info!(
            execution = %execution_id,
            experiment = %experiment.id,
            status = status.as_str(),
            duration_ms = recovery.as_millis() as u64,
            rollback = finished.rollback_triggered,
            "execution finished",
        );
        Ok(())
    }

    fn preflight(&self, experiment: &Experiment) -> std::result::Result<(), String> {
        if experiment.target.trim().is_empty() {
            return Err("target must not be empty".to_owned());
        }
        if experiment.parameters.duration.is_zero() {
            return Err("duration must be greater than zero".to_owned());
        }
        if experiment.parameters.intensity > 100 {
            return Err("intensity must be within 0-100".to_owned());
        }
        if self.inner.drivers.resolve(experiment.kind).is_none() {
            return Err(format!(
                "no driver registered for chaos kind {}",
                experiment.kind
            ));
        }
        Ok(())
    }

    /// Mark a pending execution failed without it ever entering `running`.
    fn abort_pending(&self, execution_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let finished = self.inner.store.update_execution(execution_id, |execution| {
            execution
                .metadata
                .insert("failure_reason".to_owned(), reason.to_owned());
            execution.finish(ExecutionStatus::Failed, Utc::now());
        })?;
        self.finish_accounting(&finished, ExecutionStatus::Failed);
        Ok(())
    }

    /// Terminal metrics and event emission shared by every exit path.
    fn finish_accounting(&self, execution: &Execution, status: ExecutionStatus) {
        if let Some(metrics) = &self.inner.metrics {
            if execution.started_at.is_some() {
                metrics.execution_finished(status.as_str(), execution.wall_clock());
            } else {
                metrics.execution_aborted(status.as_str());
            }
        }
        let payload = if status == ExecutionStatus::Terminated {
            EventPayload::ExecutionStopped {
                execution_id: execution.id,
                experiment_id: execution.experiment_id,
            }
        } else {
            EventPayload::ExecutionCompleted {
                execution_id: execution.id,
                experiment_id: execution.experiment_id,
                status,
            }
        };
        self.publish(payload);
    }

    fn spawn_sampler(
        &self,
        execution_id: Uuid,
        target: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gateway = self.inner.gateway.clone();
        let store = self.inner.store.clone();
        let period = self.inner.settings.sample_interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match gateway.snapshot(&target).await {
                            Ok(snapshot) => {
                                let appended = store.update_execution(execution_id, |execution| {
                                    execution.results.metrics_during.push(snapshot);
                                });
                                if appended.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(execution = %execution_id, error = %err, "in-flight sample failed");
                            }
                        }
                    }
                }
            }
        })
    }
}
