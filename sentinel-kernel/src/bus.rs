//! Realtime event bus: fire-and-forget fan-out to UI/websocket consumers.

use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod topics {
    pub const MACHINES_UPDATED: &str = "machines.updated";
    pub const MACHINES_DELETED: &str = "machines.deleted";
    pub const GROUPS_UPDATED: &str = "groups.updated";
    pub const JOBS_STATUS: &str = "jobs.status";
    pub const JOBS_EXECUTION: &str = "jobs.execution";
    pub const SECURITY_EVENT: &str = "security.event";
    pub const AUDIT_CREATED: &str = "audit.created";
    pub const KERNEL_HEALTH: &str = "kernel.health";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub time: String,
    pub topic: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Never blocks and never fails; events without subscribers are dropped.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        let time = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let payload = serde_json::to_value(payload)
            .unwrap_or_else(|_| serde_json::json!({"_ser": "error"}));
        let _ = self.tx.send(Envelope { time, topic: topic.to_string(), payload });
    }
}

/// Republishes every bus event to `<prefix>/events/<topic>`.
pub fn spawn_mqtt_bridge(bus: &EventBus, client: AsyncClient, prefix: String) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let topic = format!("{prefix}/events/{}", envelope.topic);
                    let body = match serde_json::to_vec(&envelope) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(error = %e, "bus event not serializable");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
                        warn!(error = %e, "bus bridge publish failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "bus bridge lagging, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(topics::JOBS_STATUS, &json!({"job_id": "j1", "status": "RUNNING"}));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "jobs.status");
        assert_eq!(envelope.payload["status"], "RUNNING");
        assert!(!envelope.time.is_empty());
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(topics::KERNEL_HEALTH, &i);
        }
    }
}
