//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Operator-facing orchestration facade."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use faultline_bus::EventBus;
use faultline_metrics::OrchestratorMetrics;
use faultline_store::ExperimentStore;
use faultline_types::{
    EventPayload, Execution, Experiment, ExperimentDefinition, ExperimentUpdate,
};

use crate::drivers::DriverRegistry;
use crate::engine::{EngineError, EngineSettings, ExecutionEngine, ExecutionHandle};
use crate::gateway::MetricsGateway;
use crate::scheduler::Scheduler;

/// Operator command surface. Every mutation keeps the scheduler registration
/// in sync with the stored definition and emits the matching lifecycle event.
pub struct ChaosOrchestrator {
    store: Arc<ExperimentStore>,
    engine: ExecutionEngine,
    scheduler: Arc<Scheduler>,
}

impl ChaosOrchestrator {
    /// Wire up the orchestration stack over its external collaborators.
    pub fn new(
        store: Arc<ExperimentStore>,
        drivers: Arc<DriverRegistry>,
        gateway: Arc<dyn MetricsGateway>,
        bus: EventBus,
        metrics: Option<OrchestratorMetrics>,
        settings: EngineSettings,
    ) -> Self {
        let engine = ExecutionEngine::new(store.clone(), drivers, gateway, bus, metrics, settings);
        let scheduler = Arc::new(Scheduler::new(engine.clone()));
        Self {
            store,
            engine,
            scheduler,
        }
    }

    /// Register a new experiment. Enabled experiments with an enabled
    /// schedule get a timer immediately.
    pub fn create_experiment(&self, definition: ExperimentDefinition) -> Experiment {
        let experiment = self.store.create_experiment(definition);
        self.scheduler.schedule(&experiment);
        self.sync_experiment_gauge();
        self.engine.publish(EventPayload::ExperimentCreated {
            experiment_id: experiment.id,
        });
        info!(experiment = %experiment.id, name = %experiment.name, "experiment created");
        experiment
    }

    /// Patch an experiment. A changed schedule or enable gate re-registers
    /// it: the old timer is cancelled and a new one installed, or none when
    /// the experiment is no longer schedulable.
    pub fn update_experiment(
        &self,
        experiment_id: Uuid,
        update: &ExperimentUpdate,
    ) -> Result<Experiment, EngineError> {
        let (experiment, reschedule) = self.store.update_experiment(experiment_id, update)?;
        if reschedule {
            self.scheduler.schedule(&experiment);
        }
        self.engine
            .publish(EventPayload::ExperimentUpdated { experiment_id });
        info!(experiment = %experiment_id, reschedule, "experiment updated");
        Ok(experiment)
    }

    /// Delete an experiment: cancel its schedule, stop any running
    /// executions, then remove the definition. Execution history stays.
    pub fn delete_experiment(&self, experiment_id: Uuid) -> Result<Experiment, EngineError> {
        let experiment = self.store.delete_experiment(experiment_id)?;
        self.scheduler.unschedule(experiment_id);
        let stopped = self.engine.stop_all_for_experiment(experiment_id);
        self.sync_experiment_gauge();
        self.engine
            .publish(EventPayload::ExperimentDeleted { experiment_id });
        info!(experiment = %experiment_id, stopped, "experiment deleted");
        Ok(experiment)
    }

    /// Start a run now. See [`ExecutionEngine::execute`].
    pub fn execute(
        &self,
        experiment_id: Uuid,
        immediate: bool,
    ) -> Result<ExecutionHandle, EngineError> {
        self.engine.execute(experiment_id, immediate)
    }

    /// Stop a running execution. See [`ExecutionEngine::stop_execution`].
    pub fn stop_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.engine.stop_execution(execution_id)
    }

    /// Fetch one experiment.
    pub fn get_experiment(&self, experiment_id: Uuid) -> Result<Experiment, EngineError> {
        Ok(self.store.get_experiment(experiment_id)?)
    }

    /// All registered experiments.
    pub fn list_experiments(&self) -> Vec<Experiment> {
        self.store.list_experiments()
    }

    /// Fetch one execution record for status polling.
    pub fn get_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        Ok(self.store.get_execution(execution_id)?)
    }

    /// Execution history, optionally scoped to one experiment.
    pub fn list_executions(&self, experiment_id: Option<Uuid>) -> Vec<Execution> {
        self.store.list_executions(experiment_id)
    }

    /// The underlying engine, for embedding callers.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// The scheduler, for shutdown handling.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn sync_experiment_gauge(&self) {
        if let Some(metrics) = self.engine.metrics() {
            metrics.set_experiment_count(self.store.list_experiments().len());
        }
    }
}

impl std::fmt::Debug for ChaosOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosOrchestrator")
            .field("experiments", &self.store.list_experiments().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedGateway;
    use faultline_store::StoreError;
    use faultline_types::{ExecutionStatus, ExperimentSchedule};
    use std::time::Duration;

    fn orchestrator() -> ChaosOrchestrator {
        ChaosOrchestrator::new(
            Arc::new(ExperimentStore::new()),
            Arc::new(DriverRegistry::with_simulated_defaults()),
            Arc::new(SimulatedGateway::new()),
            EventBus::new(64),
            None,
            EngineSettings {
                sample_interval: Duration::from_millis(10),
                monitor_interval: Duration::from_millis(10),
            },
        )
    }

    fn definition() -> ExperimentDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "latency probe",
            "target": "cart-service",
            "type": "network-latency",
            "parameters": {"duration": 30, "intensity": 20},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_with_schedule_arms_a_timer() {
        let orchestrator = orchestrator();
        let mut def = definition();
        def.schedule = Some(ExperimentSchedule::recurring(Duration::from_secs(3600)));
        let experiment = orchestrator.create_experiment(def);
        assert_eq!(orchestrator.scheduler().scheduled_count(), 1);
        assert_eq!(orchestrator.list_experiments().len(), 1);

        orchestrator.delete_experiment(experiment.id).unwrap();
        assert_eq!(orchestrator.scheduler().scheduled_count(), 0);
        assert!(matches!(
            orchestrator.get_experiment(experiment.id),
            Err(EngineError::Store(StoreError::ExperimentNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn disabling_cancels_the_timer() {
        let orchestrator = orchestrator();
        let mut def = definition();
        def.schedule = Some(ExperimentSchedule::recurring(Duration::from_secs(3600)));
        let experiment = orchestrator.create_experiment(def);
        assert_eq!(orchestrator.scheduler().scheduled_count(), 1);

        let update = ExperimentUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        orchestrator.update_experiment(experiment.id, &update).unwrap();
        assert_eq!(orchestrator.scheduler().scheduled_count(), 0);
    }

    #[tokio::test]
    async fn delete_stops_running_executions() {
        let orchestrator = orchestrator();
        let mut def = definition();
        def.parameters.duration = Duration::from_secs(30);
        let experiment = orchestrator.create_experiment(def);
        let handle = orchestrator.execute(experiment.id, false).unwrap();
        let execution_id = handle.execution_id;

        for _ in 0..100 {
            let status = orchestrator.get_execution(execution_id).unwrap().status;
            if status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        orchestrator.delete_experiment(experiment.id).unwrap();
        handle.join().await;

        let execution = orchestrator.get_execution(execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Terminated);
        assert!(execution.rollback_triggered);
    }

    #[tokio::test]
    async fn history_survives_experiment_deletion() {
        let orchestrator = orchestrator();
        let experiment = orchestrator.create_experiment(definition());
        let handle = orchestrator.execute(experiment.id, false).unwrap();
        let execution_id = handle.execution_id;
        handle.join().await;

        orchestrator.delete_experiment(experiment.id).unwrap();
        let execution = orchestrator.get_execution(execution_id).unwrap();
        assert!(execution.status.is_terminal());
        assert_eq!(orchestrator.list_executions(Some(experiment.id)).len(), 1);
    }
}
