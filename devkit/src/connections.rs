/*!
In-memory agent links.

Stands in for the MQTT binding: the test decides which machines are
connected, and every message the kernel pushes is kept for assertions.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

use sentinel_kernel::connections::{ConnectionError, ConnectionRegistry, OutboundMessage};
use sentinel_kernel::models::MachineId;

#[derive(Default)]
pub struct RecordingConnections {
    connected: Mutex<HashSet<MachineId>>,
    sent: Mutex<Vec<(MachineId, OutboundMessage)>>,
}

impl RecordingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, machine_id: &str) {
        self.connected.lock().insert(machine_id.to_string());
    }

    pub fn disconnect(&self, machine_id: &str) {
        self.connected.lock().remove(machine_id);
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<(MachineId, OutboundMessage)> {
        self.sent.lock().clone()
    }

    /// `(job_id, execution_id)` of every execute sent to `machine_id`.
    pub fn executes_for(&self, machine_id: &str) -> Vec<(String, String)> {
        self.sent
            .lock()
            .iter()
            .filter(|(target, _)| target == machine_id)
            .filter_map(|(_, message)| match message {
                OutboundMessage::Execute { job_id, execution_id, .. } => {
                    Some((job_id.clone(), execution_id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn cancel_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(_, message)| matches!(message, OutboundMessage::Cancel { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl ConnectionRegistry for RecordingConnections {
    async fn send(&self, machine_id: &str, message: OutboundMessage) -> Result<(), ConnectionError> {
        if !self.is_connected(machine_id) {
            return Err(ConnectionError::NotConnected(machine_id.to_string()));
        }
        tracing::debug!(machine_id, ?message, "recorded outbound message");
        self.sent.lock().push((machine_id.to_string(), message));
        Ok(())
    }

    fn is_connected(&self, machine_id: &str) -> bool {
        self.connected.lock().contains(machine_id)
    }
}
