//! ---
//! fl_section: "02-data-model-events"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Shared data model for experiments, executions, and bus events."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use uuid::Uuid;

/// Execution state machine. Transitions are monotonic and one-directional:
/// `pending -> running -> {completed | failed | rolled_back | terminated}`,
/// with the `running` stage skipped only on pre-check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record created, run not yet started.
    Pending,
    /// Fault injected; duration wait and rollback monitoring in progress.
    Running,
    /// Undo ran to normal completion with no rollback.
    Completed,
    /// Unrecoverable error in pre-checks or driver invocation.
    Failed,
    /// A rollback trigger fired during the run.
    RolledBack,
    /// Manual stop while running.
    Terminated,
}

impl ExecutionStatus {
    /// Static label used in logs, metrics, and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
            ExecutionStatus::Terminated => "terminated",
        }
    }

    /// Whether the status is one of the four terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::RolledBack
                | ExecutionStatus::Terminated
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health readings for a target, as supplied by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// CPU utilisation percentage.
    pub cpu_percent: f64,
    /// Memory utilisation percentage.
    pub memory_percent: f64,
    /// Observed response-time samples in milliseconds.
    #[serde(default)]
    pub response_times_ms: Vec<f64>,
    /// Error rate as a percentage of requests.
    pub error_rate: f64,
    /// Requests per second.
    pub throughput: f64,
}

impl MetricsSnapshot {
    /// Mean of the response-time samples, zero when there are none.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.response_times_ms.is_empty() {
            return 0.0;
        }
        self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64
    }
}

/// Post-hoc comparison of before/after metrics quantifying a run's effect.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    /// Relative response-time growth, as a percentage of the baseline.
    pub performance_degradation_pct: f64,
    /// Raw percentage-point error-rate delta.
    pub error_rate_increase: f64,
    /// Availability proxy derived from the post-run error rate, capped at 100.
    pub availability_impact: f64,
    /// Wall-clock execution duration, standing in for recovery time.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_time: Duration,
    /// Components considered exposed to the fault.
    pub blast_radius: Vec<String>,
}

/// Captured metrics and derived analysis for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResults {
    /// Baseline captured strictly before driver invocation.
    #[serde(default)]
    pub metrics_before: Option<MetricsSnapshot>,
    /// Samples taken while the fault was live.
    #[serde(default)]
    pub metrics_during: Vec<MetricsSnapshot>,
    /// Snapshot captured strictly after the undo action completed.
    #[serde(default)]
    pub metrics_after: Option<MetricsSnapshot>,
    /// Derived impact analysis, present on analysed terminal states.
    #[serde(default)]
    pub impact: Option<ImpactAnalysis>,
    /// Heuristic observations derived from the impact analysis.
    #[serde(default)]
    pub lessons_learned: Vec<String>,
}

/// One timed run of an experiment. Created by the execution engine, mutated
/// only by the engine and the rollback monitor, retained as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique execution identifier.
    pub id: Uuid,
    /// Owning experiment.
    pub experiment_id: Uuid,
    /// Current state-machine position.
    pub status: ExecutionStatus,
    /// Set when the run enters `running`.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the status becomes terminal.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Captured metrics and analysis.
    #[serde(default)]
    pub results: ExecutionResults,
    /// Whether an early rollback path ran (trigger breach or manual stop).
    #[serde(default)]
    pub rollback_triggered: bool,
    /// Reason recorded when the rollback path ran.
    #[serde(default)]
    pub rollback_reason: Option<String>,
    /// Opaque annotations, including failure reasons on the failed path.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Execution {
    /// Fresh pending record for an experiment.
    pub fn pending(experiment_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            results: ExecutionResults::default(),
            rollback_triggered: false,
            rollback_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Transition into `running`, stamping `started_at`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now);
    }

    /// Transition into a terminal state. `ended_at` is stamped only on the
    /// first call; later calls keep the original terminal timestamp.
    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        if self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
    }

    /// Wall-clock duration between start and end, when both are known.
    pub fn wall_clock(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at?;
        (ended - started).to_std().ok()
    }
}
