//! Outbound side of agent connections.

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::models::{ExecutionId, JobId, MachineId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Execute {
        job_id: JobId,
        execution_id: ExecutionId,
        command: String,
        argv: Vec<String>,
        timeout_secs: u64,
    },
    Cancel {
        job_id: JobId,
        execution_id: ExecutionId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("machine {0} is not connected")]
    NotConnected(MachineId),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn send(&self, machine_id: &str, message: OutboundMessage) -> Result<(), ConnectionError>;
    fn is_connected(&self, machine_id: &str) -> bool;
}

/// Which agents currently hold a live connection, and since when they were
/// last heard from.
#[derive(Clone, Default)]
pub struct Presence {
    seen: Arc<RwLock<HashMap<MachineId, OffsetDateTime>>>,
}

impl Presence {
    pub fn mark_seen(&self, machine_id: &str) {
        self.seen.write().insert(machine_id.to_string(), OffsetDateTime::now_utc());
    }

    pub fn mark_gone(&self, machine_id: &str) -> bool {
        self.seen.write().remove(machine_id).is_some()
    }

    pub fn is_connected(&self, machine_id: &str) -> bool {
        self.seen.read().contains_key(machine_id)
    }

    pub fn count(&self) -> usize {
        self.seen.read().len()
    }

    /// Drops every connection silent since before `cutoff`.
    pub fn expire(&self, cutoff: OffsetDateTime) -> Vec<MachineId> {
        let mut seen = self.seen.write();
        let stale: Vec<MachineId> = seen
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            seen.remove(id);
        }
        stale
    }
}

/// Commands go to `<prefix>/agents/<machine_id>/command`.
pub struct MqttConnections {
    client: AsyncClient,
    prefix: String,
    presence: Presence,
}

impl MqttConnections {
    pub fn new(client: AsyncClient, prefix: impl Into<String>, presence: Presence) -> Self {
        Self { client, prefix: prefix.into(), presence }
    }

    pub fn command_topic(&self, machine_id: &str) -> String {
        format!("{}/agents/{machine_id}/command", self.prefix)
    }
}

#[async_trait]
impl ConnectionRegistry for MqttConnections {
    async fn send(&self, machine_id: &str, message: OutboundMessage) -> Result<(), ConnectionError> {
        if !self.presence.is_connected(machine_id) {
            return Err(ConnectionError::NotConnected(machine_id.to_string()));
        }
        let body = serde_json::to_vec(&message)?;
        self.client
            .publish(self.command_topic(machine_id), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    fn is_connected(&self, machine_id: &str) -> bool {
        self.presence.is_connected(machine_id)
    }
}
