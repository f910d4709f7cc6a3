//! ---
//! fl_section: "02-data-model-events"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Shared data model for experiments, executions, and bus events."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// Lifecycle notification published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new experiment definition was registered.
    ExperimentCreated {
        /// Experiment identifier.
        experiment_id: Uuid,
    },
    /// An experiment definition was patched.
    ExperimentUpdated {
        /// Experiment identifier.
        experiment_id: Uuid,
    },
    /// An experiment was removed, cancelling its schedule.
    ExperimentDeleted {
        /// Experiment identifier.
        experiment_id: Uuid,
    },
    /// An execution entered the running state.
    ExecutionStarted {
        /// Execution identifier.
        execution_id: Uuid,
        /// Owning experiment.
        experiment_id: Uuid,
    },
    /// An execution reached a terminal state other than `terminated`.
    ExecutionCompleted {
        /// Execution identifier.
        execution_id: Uuid,
        /// Owning experiment.
        experiment_id: Uuid,
        /// Terminal status the execution reached.
        status: ExecutionStatus,
    },
    /// An execution was stopped manually.
    ExecutionStopped {
        /// Execution identifier.
        execution_id: Uuid,
        /// Owning experiment.
        experiment_id: Uuid,
    },
    /// A rollback trigger fired and the early-undo path began.
    RollbackTriggered {
        /// Execution identifier.
        execution_id: Uuid,
        /// Owning experiment.
        experiment_id: Uuid,
        /// Reason string naming the breached metric and operator.
        reason: String,
    },
}

/// Event envelope carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Actual lifecycle payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl BusEvent {
    /// Wrap a payload in a fresh envelope.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Event kind as a static label for metrics and subscriber filtering.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::ExperimentCreated { .. } => "experiment_created",
            EventPayload::ExperimentUpdated { .. } => "experiment_updated",
            EventPayload::ExperimentDeleted { .. } => "experiment_deleted",
            EventPayload::ExecutionStarted { .. } => "execution_started",
            EventPayload::ExecutionCompleted { .. } => "execution_completed",
            EventPayload::ExecutionStopped { .. } => "execution_stopped",
            EventPayload::RollbackTriggered { .. } => "rollback_triggered",
        }
    }
}
