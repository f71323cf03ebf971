//! Write-once audit trail.
//!
//! Auditing is best effort: a failed append is logged and dropped, it never
//! fails the operation that triggered it.

use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::models::{AuditEntry, MachineId, Severity};
use crate::store::PersistenceGateway;

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: String,
    pub actor: Option<String>,
    pub machine_id: Option<MachineId>,
    pub event_type: String,
    pub severity: Severity,
    pub details: Value,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, event_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            action: action.into(),
            actor: None,
            machine_id: None,
            event_type: event_type.into(),
            severity,
            details: Value::Null,
        }
    }

    pub fn machine(mut self, machine_id: impl Into<MachineId>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    fn into_entry(self) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            action: self.action,
            actor: self.actor,
            machine_id: self.machine_id,
            event_type: self.event_type,
            severity: self.severity,
            details: self.details,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone)]
pub struct AuditSink {
    gateway: Arc<dyn PersistenceGateway>,
    bus: EventBus,
    queue: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Must be called inside a tokio runtime: spawns the queue worker.
    pub fn new(gateway: Arc<dyn PersistenceGateway>, bus: EventBus) -> Self {
        let (queue, mut rx) = mpsc::channel::<AuditRecord>(QUEUE_CAPACITY);
        let worker = AuditWriter { gateway: gateway.clone(), bus: bus.clone() };
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                worker.append(record).await;
            }
            debug!("audit queue closed");
        });
        Self { gateway, bus, queue }
    }

    /// Persists now and publishes `audit.created`.
    pub async fn append(&self, record: AuditRecord) -> Option<AuditEntry> {
        AuditWriter { gateway: self.gateway.clone(), bus: self.bus.clone() }
            .append(record)
            .await
    }

    /// Queues the record for the background writer without waiting.
    pub fn record(&self, record: AuditRecord) {
        if let Err(e) = self.queue.try_send(record) {
            warn!(error = %e, "audit queue rejected record");
        }
    }
}

struct AuditWriter {
    gateway: Arc<dyn PersistenceGateway>,
    bus: EventBus,
}

impl AuditWriter {
    async fn append(&self, record: AuditRecord) -> Option<AuditEntry> {
        let entry = record.into_entry();
        match self.gateway.append_audit(&entry).await {
            Ok(()) => {
                self.bus.publish(
                    topics::AUDIT_CREATED,
                    &json!({ "id": entry.id, "action": entry.action, "severity": entry.severity }),
                );
                Some(entry)
            }
            Err(e) => {
                warn!(action = %entry.action, error = %e, "audit append failed");
                None
            }
        }
    }
}
