//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Rollback trigger evaluation loop."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use faultline_types::{Experiment, RollbackTrigger};

use crate::engine::StopCause;
use crate::gateway::MetricsGateway;

/// Per-execution safety watchdog. Runs parallel to the duration wait,
/// evaluating the experiment's rollback triggers against the gateway on a
/// fixed tick and signalling the engine on the first confirmed breach.
pub(crate) struct RollbackMonitor {
    execution_id: Uuid,
    target: String,
    triggers: Vec<RollbackTrigger>,
    gateway: Arc<dyn MetricsGateway>,
    interval: Duration,
}

impl RollbackMonitor {
    pub(crate) fn new(
        experiment: &Experiment,
        execution_id: Uuid,
        gateway: Arc<dyn MetricsGateway>,
        interval: Duration,
    ) -> Self {
        Self {
            execution_id,
            target: experiment.target.clone(),
            triggers: experiment.rollback_triggers.clone(),
            gateway,
            interval,
        }
    }

    /// Evaluate triggers until a breach is confirmed or the shutdown flag
    /// flips. A breach must persist for the trigger's `confirm_duration`
    /// before the rollback fires; a healthy reading resets the clock.
    pub(crate) async fn run(
        self,
        verdict: mpsc::Sender<StopCause>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.triggers.is_empty() {
            debug!(execution = %self.execution_id, "no rollback triggers; monitor idle");
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first_breach: Vec<Option<Instant>> = vec![None; self.triggers.len()];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(execution = %self.execution_id, "rollback monitor stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if self.evaluate_once(&verdict, &mut first_breach).await {
                        return;
                    }
                }
            }
        }
    }

    /// One evaluation pass. Returns true when a rollback was signalled.
    async fn evaluate_once(
        &self,
        verdict: &mpsc::Sender<StopCause>,
        first_breach: &mut [Option<Instant>],
    ) -> bool {
        for (index, trigger) in self.triggers.iter().enumerate() {
            let value = match self.gateway.get_metric(&trigger.metric, &self.target).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        execution = %self.execution_id,
                        metric = %trigger.metric,
                        error = %err,
                        "metric fetch failed; skipping trigger this tick",
                    );
                    continue;
                }
            };

            if trigger.operator.compare(value, trigger.threshold) {
                let since = first_breach[index].get_or_insert_with(Instant::now);
                if since.elapsed() >= trigger.confirm_duration {
                    warn!(
                        execution = %self.execution_id,
                        metric = %trigger.metric,
                        value,
                        threshold = trigger.threshold,
                        operator = trigger.operator.as_str(),
                        "rollback trigger breached",
                    );
                    let cause = StopCause::Trigger {
                        metric: trigger.metric.clone(),
                        reason: trigger.breach_reason(),
                    };
                    let _ = verdict.send(cause).await;
                    return true;
                }
                debug!(
                    execution = %self.execution_id,
                    metric = %trigger.metric,
                    value,
                    "breach observed, awaiting confirmation window",
                );
            } else {
                first_breach[index] = None;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use faultline_types::{ExperimentDefinition, MetricsSnapshot, TriggerOperator};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct StaticGateway {
        values: HashMap<String, f64>,
    }

    #[async_trait::async_trait]
    impl MetricsGateway for StaticGateway {
        async fn get_metric(&self, name: &str, _target: &str) -> Result<f64> {
            self.values
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("unknown metric {name}"))
        }

        async fn snapshot(&self, _target: &str) -> Result<MetricsSnapshot> {
            unimplemented!("monitor only reads single metrics")
        }
    }

    struct SequenceGateway {
        values: Mutex<Vec<f64>>,
    }

    #[async_trait::async_trait]
    impl MetricsGateway for SequenceGateway {
        async fn get_metric(&self, _name: &str, _target: &str) -> Result<f64> {
            let mut values = self.values.lock();
            if values.len() > 1 {
                Ok(values.remove(0))
            } else {
                Ok(values[0])
            }
        }

        async fn snapshot(&self, _target: &str) -> Result<MetricsSnapshot> {
            unimplemented!("monitor only reads single metrics")
        }
    }

    fn experiment(confirm: Duration) -> Experiment {
        let mut definition: ExperimentDefinition = serde_json::from_value(serde_json::json!({
            "name": "cpu guard",
            "target": "checkout-service",
            "type": "cpu-stress",
            "parameters": {"duration": 60000, "intensity": 80},
            "rollback_triggers": [
                {"metric": "cpu_usage", "threshold": 95.0, "operator": "gt"}
            ],
        }))
        .unwrap();
        definition.rollback_triggers[0].confirm_duration = confirm;
        Experiment::from_definition(definition)
    }

    fn harness(
        gateway: Arc<dyn MetricsGateway>,
        confirm: Duration,
    ) -> (
        RollbackMonitor,
        mpsc::Receiver<StopCause>,
        mpsc::Sender<StopCause>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let experiment = experiment(confirm);
        let monitor = RollbackMonitor::new(
            &experiment,
            Uuid::new_v4(),
            gateway,
            Duration::from_millis(10),
        );
        let (verdict_tx, verdict_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (monitor, verdict_rx, verdict_tx, shutdown_tx, shutdown_rx)
    }

    #[tokio::test]
    async fn breach_signals_rollback_with_reason() {
        let gateway = Arc::new(StaticGateway {
            values: HashMap::from([("cpu_usage".to_owned(), 98.0)]),
        });
        let (monitor, mut verdicts, verdict_tx, _shutdown_tx, shutdown_rx) =
            harness(gateway, Duration::ZERO);
        tokio::spawn(monitor.run(verdict_tx, shutdown_rx));

        let cause = verdicts.recv().await.expect("rollback signalled");
        match cause {
            StopCause::Trigger { metric, reason } => {
                assert_eq!(metric, "cpu_usage");
                assert!(reason.contains("cpu_usage gt 95"));
            }
            other => panic!("unexpected cause {other:?}"),
        }
    }

    #[tokio::test]
    async fn healthy_metric_never_signals() {
        let gateway = Arc::new(StaticGateway {
            values: HashMap::from([("cpu_usage".to_owned(), 50.0)]),
        });
        let (monitor, mut verdicts, verdict_tx, shutdown_tx, shutdown_rx) =
            harness(gateway, Duration::ZERO);
        let task = tokio::spawn(monitor.run(verdict_tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(verdicts.try_recv().is_err());
    }

    #[tokio::test]
    async fn confirm_duration_defers_the_verdict() {
        let gateway = Arc::new(StaticGateway {
            values: HashMap::from([("cpu_usage".to_owned(), 98.0)]),
        });
        let confirm = Duration::from_millis(50);
        let (monitor, mut verdicts, verdict_tx, _shutdown_tx, shutdown_rx) =
            harness(gateway, confirm);
        let started = std::time::Instant::now();
        tokio::spawn(monitor.run(verdict_tx, shutdown_rx));

        verdicts.recv().await.expect("rollback signalled");
        assert!(started.elapsed() >= confirm);
    }

    #[tokio::test]
    async fn recovered_breach_resets_the_confirmation_clock() {
        // Breach, recover, then breach persistently; the early breach must
        // not count towards the confirmation window.
        let gateway = Arc::new(SequenceGateway {
            values: Mutex::new(vec![98.0, 50.0, 98.0]),
        });
        let confirm = Duration::from_millis(40);
        let (monitor, mut verdicts, verdict_tx, _shutdown_tx, shutdown_rx) =
            harness(gateway, confirm);
        let started = std::time::Instant::now();
        tokio::spawn(monitor.run(verdict_tx, shutdown_rx));

        verdicts.recv().await.expect("rollback signalled");
        // First tick at 10ms breaches, second recovers, third re-breaches
        // around 30ms; the verdict waits out confirm from there.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
