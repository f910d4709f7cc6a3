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
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use uuid::Uuid;

/// Closed set of chaos categories supported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChaosKind {
    /// Add artificial latency on the network path of the target.
    NetworkLatency,
    /// Saturate CPU on the target.
    CpuStress,
    /// Exhaust memory on the target.
    MemoryStress,
    /// Disrupt the target's database dependency.
    DatabaseFailure,
    /// Disrupt a named downstream dependency of the target.
    DependencyChaos,
    /// Saturate disk I/O on the target.
    DiskIoStress,
    /// Terminate a pod backing the target.
    PodTermination,
    /// Disrupt the target service itself.
    ServiceDisruption,
}

impl ChaosKind {
    /// Every supported kind, in declaration order.
    pub const ALL: [ChaosKind; 8] = [
        ChaosKind::NetworkLatency,
        ChaosKind::CpuStress,
        ChaosKind::MemoryStress,
        ChaosKind::DatabaseFailure,
        ChaosKind::DependencyChaos,
        ChaosKind::DiskIoStress,
        ChaosKind::PodTermination,
        ChaosKind::ServiceDisruption,
    ];

    /// Represent the kind as a static label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChaosKind::NetworkLatency => "network-latency",
            ChaosKind::CpuStress => "cpu-stress",
            ChaosKind::MemoryStress => "memory-stress",
            ChaosKind::DatabaseFailure => "database-failure",
            ChaosKind::DependencyChaos => "dependency-chaos",
            ChaosKind::DiskIoStress => "disk-io-stress",
            ChaosKind::PodTermination => "pod-termination",
            ChaosKind::ServiceDisruption => "service-disruption",
        }
    }
}

impl fmt::Display for ChaosKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault parameters common to every chaos kind plus free-form extras.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentParameters {
    /// How long the fault stays injected (milliseconds on the wire).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    /// Fault intensity on a 0-100 scale.
    pub intensity: u8,
    /// Type-specific fields (latency_ms, worker count, device name, ...).
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ExperimentParameters {
    /// Construct parameters with no type-specific extras.
    pub fn new(duration: Duration, intensity: u8) -> Self {
        Self {
            duration,
            intensity,
            extra: BTreeMap::new(),
        }
    }
}

/// When an experiment should fire.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at a future timestamp. Timestamps in the past are skipped.
    OneShot {
        /// Absolute UTC time of the single run.
        start_at: DateTime<Utc>,
    },
    /// Fire repeatedly at a fixed interval.
    Recurring {
        /// Interval between runs (seconds on the wire).
        #[serde_as(as = "DurationSeconds<u64>")]
        interval: Duration,
    },
}

/// Schedule attached to an experiment, with its own enable gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSchedule {
    /// One-shot or recurring firing rule.
    #[serde(flatten)]
    pub kind: ScheduleKind,
    /// Whether the schedule is armed. Disabled schedules install no timer.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ExperimentSchedule {
    /// A one-shot schedule firing at `start_at`.
    pub fn one_shot(start_at: DateTime<Utc>) -> Self {
        Self {
            kind: ScheduleKind::OneShot { start_at },
            enabled: true,
        }
    }

    /// A recurring schedule firing every `interval`.
    pub fn recurring(interval: Duration) -> Self {
        Self {
            kind: ScheduleKind::Recurring { interval },
            enabled: true,
        }
    }
}

/// Comparison operator applied by rollback triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOperator {
    /// Metric strictly greater than the threshold.
    Gt,
    /// Metric greater than or equal to the threshold.
    Gte,
    /// Metric strictly less than the threshold.
    Lt,
    /// Metric less than or equal to the threshold.
    Lte,
    /// Metric equal to the threshold.
    Eq,
}

impl TriggerOperator {
    /// Static label used in logs and rollback reasons.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOperator::Gt => "gt",
            TriggerOperator::Gte => "gte",
            TriggerOperator::Lt => "lt",
            TriggerOperator::Lte => "lte",
            TriggerOperator::Eq => "eq",
        }
    }

    /// Evaluate `value <op> threshold`.
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            TriggerOperator::Gt => value > threshold,
            TriggerOperator::Gte => value >= threshold,
            TriggerOperator::Lt => value < threshold,
            TriggerOperator::Lte => value <= threshold,
            TriggerOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for TriggerOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety rule forcing early rollback when a live metric breaches a threshold.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTrigger {
    /// Metric name resolved against the metrics gateway.
    pub metric: String,
    /// Threshold the metric is compared against.
    pub threshold: f64,
    /// Comparison operator.
    pub operator: TriggerOperator,
    /// How long the breach must persist before the rollback fires.
    /// Zero fires on the first observed breach.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub confirm_duration: Duration,
}

impl RollbackTrigger {
    /// Trigger firing on the first observed breach.
    pub fn immediate(metric: impl Into<String>, operator: TriggerOperator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            operator,
            confirm_duration: Duration::ZERO,
        }
    }

    /// Rollback reason recorded when this trigger fires.
    pub fn breach_reason(&self) -> String {
        format!(
            "threshold_exceeded: {} {} {}",
            self.metric,
            self.operator.as_str(),
            self.threshold
        )
    }
}

/// Operator-supplied experiment payload, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    /// Human-readable experiment name.
    pub name: String,
    /// Free-form description of the hypothesis under test.
    #[serde(default)]
    pub description: String,
    /// Identifier of the system under test.
    pub target: String,
    /// Chaos category to inject.
    #[serde(rename = "type")]
    pub kind: ChaosKind,
    /// Fault parameters.
    pub parameters: ExperimentParameters,
    /// Optional firing schedule.
    #[serde(default)]
    pub schedule: Option<ExperimentSchedule>,
    /// Gates scheduled (not manual) execution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered safety rules. May be empty; the experiment then only rolls
    /// back on normal completion or manual stop.
    #[serde(default)]
    pub rollback_triggers: Vec<RollbackTrigger>,
    /// Opaque annotations (category, severity, blast-radius hints).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Stored experiment: a definition plus identity. Immutable while running,
/// editable between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique, immutable identifier.
    pub id: Uuid,
    /// Human-readable experiment name.
    pub name: String,
    /// Free-form description of the hypothesis under test.
    #[serde(default)]
    pub description: String,
    /// Identifier of the system under test.
    pub target: String,
    /// Chaos category to inject.
    #[serde(rename = "type")]
    pub kind: ChaosKind,
    /// Fault parameters.
    pub parameters: ExperimentParameters,
    /// Optional firing schedule.
    #[serde(default)]
    pub schedule: Option<ExperimentSchedule>,
    /// Gates scheduled (not manual) execution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered safety rules.
    #[serde(default)]
    pub rollback_triggers: Vec<RollbackTrigger>,
    /// Opaque annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    /// Materialize a stored experiment from a definition, assigning identity.
    pub fn from_definition(definition: ExperimentDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: definition.name,
            description: definition.description,
            target: definition.target,
            kind: definition.kind,
            parameters: definition.parameters,
            schedule: definition.schedule,
            enabled: definition.enabled,
            rollback_triggers: definition.rollback_triggers,
            metadata: definition.metadata,
            created_at: Utc::now(),
        }
    }

    /// Whether the scheduler should install a timer for this experiment.
    pub fn schedulable(&self) -> bool {
        self.enabled
            && self
                .schedule
                .as_ref()
                .map(|schedule| schedule.enabled)
                .unwrap_or(false)
    }
}

/// Patch applied to a stored experiment. `None` fields are left untouched;
/// `clear_schedule` removes the schedule outright.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    /// Replacement name.
    #[serde(default)]
    pub name: Option<String>,
    /// Replacement description.
    #[serde(default)]
    pub description: Option<String>,
    /// Replacement target.
    #[serde(default)]
    pub target: Option<String>,
    /// Replacement chaos kind.
    #[serde(default, rename = "type")]
    pub kind: Option<ChaosKind>,
    /// Replacement parameters.
    #[serde(default)]
    pub parameters: Option<ExperimentParameters>,
    /// Replacement schedule.
    #[serde(default)]
    pub schedule: Option<ExperimentSchedule>,
    /// Remove the schedule entirely. Wins over `schedule`.
    #[serde(default)]
    pub clear_schedule: bool,
    /// Replacement enable gate.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replacement safety rules.
    #[serde(default)]
    pub rollback_triggers: Option<Vec<RollbackTrigger>>,
    /// Replacement annotations.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ExperimentUpdate {
    /// Apply the patch in place. Returns true when the `enabled` gate or the
    /// schedule changed, which requires scheduler re-registration.
    pub fn apply(&self, experiment: &mut Experiment) -> bool {
        let mut reschedule = false;
        if let Some(name) = &self.name {
            experiment.name = name.clone();
        }
        if let Some(description) = &self.description {
            experiment.description = description.clone();
        }
        if let Some(target) = &self.target {
            experiment.target = target.clone();
        }
        if let Some(kind) = self.kind {
            experiment.kind = kind;
        }
        if let Some(parameters) = &self.parameters {
            experiment.parameters = parameters.clone();
        }
        if self.clear_schedule {
            reschedule |= experiment.schedule.is_some();
            experiment.schedule = None;
        } else if let Some(schedule) = &self.schedule {
            reschedule |= experiment.schedule.as_ref() != Some(schedule);
            experiment.schedule = Some(schedule.clone());
        }
        if let Some(enabled) = self.enabled {
            reschedule |= experiment.enabled != enabled;
            experiment.enabled = enabled;
        }
        if let Some(triggers) = &self.rollback_triggers {
            experiment.rollback_triggers = triggers.clone();
        }
        if let Some(metadata) = &self.metadata {
            experiment.metadata = metadata.clone();
        }
        reschedule
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chaos_kind_round_trips_kebab_case() {
        let json = serde_json::to_string(&ChaosKind::DiskIoStress).unwrap();
        assert_eq!(json, "\"disk-io-stress\"");
        let kind: ChaosKind = serde_json::from_str("\"pod-termination\"").unwrap();
        assert_eq!(kind, ChaosKind::PodTermination);
    }

    #[test]
    fn operator_comparisons() {
        assert!(TriggerOperator::Gt.compare(98.0, 95.0));
        assert!(!TriggerOperator::Gt.compare(95.0, 95.0));
        assert!(TriggerOperator::Gte.compare(95.0, 95.0));
        assert!(TriggerOperator::Lt.compare(1.0, 2.0));
        assert!(TriggerOperator::Lte.compare(2.0, 2.0));
        assert!(TriggerOperator::Eq.compare(2.0, 2.0));
        assert!(!TriggerOperator::Eq.compare(2.1, 2.0));
    }

    #[test]
    fn definition_parses_from_toml() {
        let definition: ExperimentDefinition = toml::from_str(
            r#"
            name = "checkout cpu burn"
            target = "checkout-service"
            type = "cpu-stress"

            [parameters]
            duration = 2000
            intensity = 80
            workers = 4

            [schedule]
            mode = "recurring"
            interval = 3600

            [[rollback_triggers]]
            metric = "cpu_usage"
            threshold = 95.0
            operator = "gt"
            "#,
        )
        .unwrap();
        assert_eq!(definition.kind, ChaosKind::CpuStress);
        assert_eq!(definition.parameters.duration, Duration::from_millis(2000));
        assert_eq!(definition.parameters.intensity, 80);
        assert_eq!(
            definition.parameters.extra.get("workers"),
            Some(&serde_json::json!(4))
        );
        assert!(definition.enabled);
        let schedule = definition.schedule.expect("schedule present");
        assert!(schedule.enabled);
        assert_eq!(
            schedule.kind,
            ScheduleKind::Recurring {
                interval: Duration::from_secs(3600)
            }
        );
        assert_eq!(definition.rollback_triggers.len(), 1);
        assert_eq!(
            definition.rollback_triggers[0].confirm_duration,
            Duration::ZERO
        );
    }

    #[test]
    fn breach_reason_names_metric_and_operator() {
        let trigger = RollbackTrigger::immediate("cpu_usage", TriggerOperator::Gt, 95.0);
        assert_eq!(trigger.breach_reason(), "threshold_exceeded: cpu_usage gt 95");
    }

    #[test]
    fn update_reports_reschedule_only_on_gate_or_schedule_change() {
        let definition: ExperimentDefinition = serde_json::from_value(serde_json::json!({
            "name": "exp",
            "target": "svc",
            "type": "network-latency",
            "parameters": {"duration": 1000, "intensity": 10},
        }))
        .unwrap();
        let mut experiment = Experiment::from_definition(definition);

        let rename = ExperimentUpdate {
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(!rename.apply(&mut experiment));
        assert_eq!(experiment.name, "renamed");

        let disable = ExperimentUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        assert!(disable.apply(&mut experiment));
        assert!(!experiment.schedulable());

        let arm = ExperimentUpdate {
            schedule: Some(ExperimentSchedule::recurring(Duration::from_secs(60))),
            ..Default::default()
        };
        assert!(arm.apply(&mut experiment));
    }
}
