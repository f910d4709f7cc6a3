//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Schedule-to-execution timer layer."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use faultline_types::{Experiment, ScheduleKind};

use crate::engine::ExecutionEngine;

/// Translates experiment schedules into timed [`ExecutionEngine::execute`]
/// calls. One timer task per experiment; re-registering an id first cancels
/// the old timer so duplicates cannot arm.
pub struct Scheduler {
    engine: ExecutionEngine,
    jobs: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler firing into the given engine.
    pub fn new(engine: ExecutionEngine) -> Self {
        Self {
            engine,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) the timer for an experiment. Disabled
    /// experiments and disabled or absent schedules leave no timer armed.
    /// One-shot start times already in the past are skipped, never run
    /// retroactively.
    pub fn schedule(&self, experiment: &Experiment) {
        self.unschedule(experiment.id);
        if !experiment.schedulable() {
            debug!(experiment = %experiment.id, "not schedulable; no timer armed");
            return;
        }
        let Some(schedule) = &experiment.schedule else {
            return;
        };

        let engine = self.engine.clone();
        let experiment_id = experiment.id;
        let task = match &schedule.kind {
            ScheduleKind::OneShot { start_at } => {
                let now = Utc::now();
                if *start_at <= now {
                    info!(
                        experiment = %experiment_id,
                        start_at = %start_at,
                        "one-shot start time already passed; skipping",
                    );
                    return;
                }
                let delay = (*start_at - now).to_std().unwrap_or_default();
                debug!(
                    experiment = %experiment_id,
                    delay_ms = delay.as_millis() as u64,
                    "one-shot timer armed",
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    fire(&engine, experiment_id);
                })
            }
            ScheduleKind::Recurring { interval } => {
                let period = *interval;
                debug!(
                    experiment = %experiment_id,
                    interval_ms = period.as_millis() as u64,
                    "recurring timer armed",
                );
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        // Each tick fires without waiting for the prior run;
                        // overlapping executions are allowed.
                        fire(&engine, experiment_id);
                    }
                })
            }
        };
        self.jobs.lock().insert(experiment_id, task);
    }

    /// Cancel any outstanding timer for an experiment. Idempotent.
    pub fn unschedule(&self, experiment_id: Uuid) {
        if let Some(task) = self.jobs.lock().remove(&experiment_id) {
            task.abort();
            debug!(experiment = %experiment_id, "timer cancelled");
        }
    }

    /// Number of experiments with an armed timer.
    pub fn scheduled_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Cancel every timer. Called on daemon shutdown.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock();
        for (experiment_id, task) in jobs.drain() {
            task.abort();
            debug!(experiment = %experiment_id, "timer cancelled at shutdown");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduled", &self.scheduled_count())
            .finish_non_exhaustive()
    }
}

fn fire(engine: &ExecutionEngine, experiment_id: Uuid) {
    match engine.execute(experiment_id, false) {
        Ok(handle) => {
            debug!(
                experiment = %experiment_id,
                execution = %handle.execution_id,
                "scheduled run started",
            );
        }
        Err(err) => {
            warn!(experiment = %experiment_id, error = %err, "scheduled run failed to start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverRegistry;
    use crate::engine::EngineSettings;
    use crate::gateway::SimulatedGateway;
    use faultline_bus::EventBus;
    use faultline_store::ExperimentStore;
    use faultline_types::ExperimentDefinition;
    use std::sync::Arc;
    use std::time::Duration;

    fn harness() -> (Arc<ExperimentStore>, ExecutionEngine, Scheduler) {
        let store = Arc::new(ExperimentStore::new());
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(DriverRegistry::with_simulated_defaults()),
            Arc::new(SimulatedGateway::new()),
            EventBus::new(32),
            None,
            EngineSettings {
                sample_interval: Duration::from_millis(10),
                monitor_interval: Duration::from_millis(10),
            },
        );
        let scheduler = Scheduler::new(engine.clone());
        (store, engine, scheduler)
    }

    fn definition(schedule: serde_json::Value) -> ExperimentDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "scheduled burn",
            "target": "checkout-service",
            "type": "cpu-stress",
            "parameters": {"duration": 20, "intensity": 10},
            "schedule": schedule,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn recurring_schedule_fires_repeatedly() {
        let (store, _engine, scheduler) = harness();
        let experiment = store.create_experiment(definition(serde_json::json!({
            "mode": "recurring",
            "interval": 0,
        })));
        // Sub-second intervals are not expressible in config; tighten the
        // parsed schedule directly for the test.
        let mut experiment = experiment;
        experiment.schedule = Some(faultline_types::ExperimentSchedule::recurring(
            Duration::from_millis(25),
        ));
        scheduler.schedule(&experiment);
        assert_eq!(scheduler.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.unschedule(experiment.id);
        let fired = store.list_executions(Some(experiment.id)).len();
        assert!(fired >= 2, "expected repeated firings, saw {fired}");
    }

    #[tokio::test]
    async fn unschedule_stops_future_firings() {
        let (store, _engine, scheduler) = harness();
        let mut experiment = store.create_experiment(definition(serde_json::json!({
            "mode": "recurring",
            "interval": 3600,
        })));
        experiment.schedule = Some(faultline_types::ExperimentSchedule::recurring(
            Duration::from_millis(25),
        ));
        scheduler.schedule(&experiment);
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.unschedule(experiment.id);
        let baseline = store.list_executions(Some(experiment.id)).len();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let after = store.list_executions(Some(experiment.id)).len();
        assert_eq!(baseline, after, "no firings after unschedule");
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn past_one_shot_never_fires() {
        let (store, _engine, scheduler) = harness();
        let experiment = store.create_experiment(definition(serde_json::json!({
            "mode": "one_shot",
            "start_at": "2020-01-01T00:00:00Z",
        })));
        scheduler.schedule(&experiment);
        assert_eq!(scheduler.scheduled_count(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.list_executions(Some(experiment.id)).is_empty());
    }

    #[tokio::test]
    async fn future_one_shot_fires_once() {
        let (store, _engine, scheduler) = harness();
        let mut experiment = store.create_experiment(definition(serde_json::json!({
            "mode": "recurring",
            "interval": 3600,
        })));
        experiment.schedule = Some(faultline_types::ExperimentSchedule::one_shot(
            Utc::now() + chrono::Duration::milliseconds(30),
        ));
        scheduler.schedule(&experiment);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.list_executions(Some(experiment.id)).len(), 1);
    }

    #[tokio::test]
    async fn disabled_experiment_arms_no_timer() {
        let (store, _engine, scheduler) = harness();
        let mut def = definition(serde_json::json!({
            "mode": "recurring",
            "interval": 3600,
        }));
        def.enabled = false;
        let experiment = store.create_experiment(def);
        scheduler.schedule(&experiment);
        assert_eq!(scheduler.scheduled_count(), 0);
    }
}
