//! ---
//! fl_section: "03-registry-state"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "In-memory registry of experiments and execution records."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! In-memory registry owning experiment definitions and execution history.
//! All access goes through [`ExperimentStore`]; there is no ambient global
//! state. Reads hand out clones, writes run under the store lock so the
//! engine and the rollback monitor never lose updates to the same record.

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use faultline_types::{Execution, Experiment, ExperimentDefinition, ExperimentUpdate};

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced experiment does not exist.
    #[error("experiment {0} not found")]
    ExperimentNotFound(Uuid),
    /// The referenced execution does not exist.
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
}

/// Convenience result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Default)]
struct StoreInner {
    experiments: IndexMap<Uuid, Experiment>,
    executions: IndexMap<Uuid, Execution>,
}

/// Concurrency-safe registry of experiments and executions.
#[derive(Debug, Default)]
pub struct ExperimentStore {
    inner: Mutex<StoreInner>,
}

impl ExperimentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new experiment, assigning a fresh identifier.
    pub fn create_experiment(&self, definition: ExperimentDefinition) -> Experiment {
        let experiment = Experiment::from_definition(definition);
        let mut inner = self.inner.lock();
        inner.experiments.insert(experiment.id, experiment.clone());
        debug!(experiment = %experiment.id, name = %experiment.name, "experiment registered");
        experiment
    }

    /// Re-register an experiment restored from persistence, keeping its id.
    pub fn insert_experiment(&self, experiment: Experiment) {
        let mut inner = self.inner.lock();
        debug!(experiment = %experiment.id, "experiment restored");
        inner.experiments.insert(experiment.id, experiment);
    }

    /// Patch an existing experiment. Returns the updated record and whether
    /// the scheduler needs to re-register it.
    pub fn update_experiment(
        &self,
        id: Uuid,
        update: &ExperimentUpdate,
    ) -> Result<(Experiment, bool)> {
        let mut inner = self.inner.lock();
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or(StoreError::ExperimentNotFound(id))?;
        let reschedule = update.apply(experiment);
        Ok((experiment.clone(), reschedule))
    }

    /// Remove an experiment, returning its final definition.
    pub fn delete_experiment(&self, id: Uuid) -> Result<Experiment> {
        let mut inner = self.inner.lock();
        inner
            .experiments
            .shift_remove(&id)
            .ok_or(StoreError::ExperimentNotFound(id))
    }

    /// Fetch an experiment by id.
    pub fn get_experiment(&self, id: Uuid) -> Result<Experiment> {
        let inner = self.inner.lock();
        inner
            .experiments
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExperimentNotFound(id))
    }

    /// All experiments in registration order.
    pub fn list_experiments(&self) -> Vec<Experiment> {
        let inner = self.inner.lock();
        inner.experiments.values().cloned().collect()
    }

    /// Record a new execution.
    pub fn insert_execution(&self, execution: Execution) {
        let mut inner = self.inner.lock();
        inner.executions.insert(execution.id, execution);
    }

    /// Apply a closure to an execution under the store lock. The serialized
    /// read-modify-write keeps engine and monitor updates from clobbering
    /// each other.
    pub fn update_execution<F>(&self, id: Uuid, mutate: F) -> Result<Execution>
    where
        F: FnOnce(&mut Execution),
    {
        let mut inner = self.inner.lock();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        mutate(execution);
        Ok(execution.clone())
    }

    /// Fetch an execution by id.
    pub fn get_execution(&self, id: Uuid) -> Result<Execution> {
        let inner = self.inner.lock();
        inner
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    /// Executions in creation order, optionally filtered to one experiment.
    pub fn list_executions(&self, experiment_id: Option<Uuid>) -> Vec<Execution> {
        let inner = self.inner.lock();
        inner
            .executions
            .values()
            .filter(|execution| {
                experiment_id
                    .map(|id| execution.experiment_id == id)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Identifiers of currently running executions for an experiment.
    pub fn running_execution_ids(&self, experiment_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.lock();
        inner
            .executions
            .values()
            .filter(|execution| {
                execution.experiment_id == experiment_id
                    && execution.status == faultline_types::ExecutionStatus::Running
            })
            .map(|execution| execution.id)
            .collect()
    }

    /// Store-wide cleanup discarding execution history.
    pub fn clear_executions(&self) -> usize {
        let mut inner = self.inner.lock();
        let drained = inner.executions.len();
        inner.executions.clear();
        debug!(drained, cleared_at = %Utc::now(), "execution history cleared");
        drained
    }
}
