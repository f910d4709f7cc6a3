//! ---
//! fl_section: "02-data-model-events"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Lifecycle event bus and alerting sink seam."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! Publish/subscribe channel for orchestrator lifecycle events. The bus is a
//! buffered broadcast: publishing never blocks, and a stalled subscriber lags
//! and drops events instead of stalling the orchestration loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use faultline_types::{BusEvent, EventPayload};

/// Broadcast bus carrying [`BusEvent`] envelopes to any number of observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Wrap the payload in an envelope and publish it. Events published with
    /// no subscribers are dropped silently; that is normal during startup.
    pub fn publish(&self, payload: EventPayload) -> BusEvent {
        let event = BusEvent::new(payload);
        debug!(kind = event.kind(), event = %event.id, "event published");
        let _ = self.sender.send(event.clone());
        event
    }

    /// Attach a new subscriber receiving events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Delivery seam for operator alerting. Implementations must not block for
/// long periods; the forwarder task isolates them from publishers regardless.
#[async_trait::async_trait]
pub trait AlertingSink: Send + Sync {
    /// Deliver one alert.
    async fn send_alert(
        &self,
        level: &str,
        message: &str,
        metadata: BTreeMap<String, JsonValue>,
    ) -> Result<()>;
}

/// Sink that writes alerts to the tracing log. The default for deployments
/// without a paging integration.
#[derive(Debug, Default)]
pub struct LogAlertingSink;

#[async_trait::async_trait]
impl AlertingSink for LogAlertingSink {
    async fn send_alert(
        &self,
        level: &str,
        message: &str,
        metadata: BTreeMap<String, JsonValue>,
    ) -> Result<()> {
        warn!(
            target: "faultline::alerting",
            level,
            metadata = %JsonValue::Object(metadata.into_iter().collect()),
            "{message}"
        );
        Ok(())
    }
}

/// Forward rollback events from the bus to an alerting sink on a dedicated
/// task. The task drains until every bus sender is dropped; lagged windows
/// are logged and skipped so a slow sink never backpressures the engine.
pub fn spawn_alert_forwarder(bus: &EventBus, sink: Arc<dyn AlertingSink>) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let EventPayload::RollbackTriggered {
                        execution_id,
                        experiment_id,
                        reason,
                    } = &event.payload
                    else {
                        continue;
                    };
                    let mut metadata = BTreeMap::new();
                    metadata.insert(
                        "execution_id".to_owned(),
                        JsonValue::String(execution_id.to_string()),
                    );
                    metadata.insert(
                        "experiment_id".to_owned(),
                        JsonValue::String(experiment_id.to_string()),
                    );
                    let message = format!("rollback triggered: {reason}");
                    if let Err(err) = sink.send_alert("critical", &message, metadata).await {
                        warn!(error = %err, execution = %execution_id, "alert delivery failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "alert forwarder lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("alert forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_types::ExecutionStatus;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl AlertingSink for RecordingSink {
        async fn send_alert(
            &self,
            level: &str,
            message: &str,
            _metadata: BTreeMap<String, JsonValue>,
        ) -> Result<()> {
            self.alerts.lock().push((level.to_owned(), message.to_owned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let published = bus.publish(EventPayload::ExperimentCreated {
            experiment_id: Uuid::new_v4(),
        });
        let received = events.recv().await.unwrap();
        assert_eq!(received.id, published.id);
        assert_eq!(received.kind(), "experiment_created");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_block() {
        let bus = EventBus::new(1);
        for _ in 0..16 {
            bus.publish(EventPayload::ExecutionCompleted {
                execution_id: Uuid::new_v4(),
                experiment_id: Uuid::new_v4(),
                status: ExecutionStatus::Completed,
            });
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_stalling_publisher() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for _ in 0..8 {
            bus.publish(EventPayload::ExperimentUpdated {
                experiment_id: Uuid::new_v4(),
            });
        }
        // The first recv observes the overflow, later recvs drain the window.
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(slow.recv().await.is_ok());
    }

    #[tokio::test]
    async fn forwarder_alerts_on_rollback_events_only() {
        let bus = EventBus::new(8);
        let sink = Arc::new(RecordingSink::default());
        let task = spawn_alert_forwarder(&bus, sink.clone());

        bus.publish(EventPayload::ExperimentCreated {
            experiment_id: Uuid::new_v4(),
        });
        bus.publish(EventPayload::RollbackTriggered {
            execution_id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            reason: "threshold_exceeded: cpu_usage gt 95".into(),
        });

        drop(bus);
        task.await.unwrap();

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, "critical");
        assert!(alerts[0].1.contains("cpu_usage gt 95"));
    }
}
