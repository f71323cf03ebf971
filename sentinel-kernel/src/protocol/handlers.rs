//! One handler per [`MessageKind`].

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{MessageKind, NormalizedEvent, NormalizedMessage};
use super::router::{MessageHandler, Router, RouterError};
use super::ConnectionContext;
use crate::audit::{AuditRecord, AuditSink};
use crate::bus::{topics, EventBus};
use crate::cache::StateCache;
use crate::error::{KernelError, KernelResult};
use crate::inventory::Inventory;
use crate::jobs::JobOrchestrator;
use crate::models::{MachineId, MetricSample, SecurityEvent, SecurityEventStatus, Severity};
use crate::store::PersistenceGateway;

#[derive(Clone)]
pub struct HandlerDeps {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub cache: Arc<StateCache>,
    pub inventory: Arc<Inventory>,
    pub jobs: Arc<JobOrchestrator>,
    pub bus: EventBus,
    pub audit: AuditSink,
}

/// The kernel's router; fails if a kind was left without a handler.
pub fn router(deps: &HandlerDeps) -> Result<Router, RouterError> {
    Router::builder()
        .on(MessageKind::Registration, Arc::new(RegistrationHandler { inventory: deps.inventory.clone() }))
        .on(
            MessageKind::Heartbeat,
            Arc::new(HeartbeatHandler { cache: deps.cache.clone(), gateway: deps.gateway.clone(), bus: deps.bus.clone() }),
        )
        .on(
            MessageKind::MetricReport,
            Arc::new(MetricHandler { cache: deps.cache.clone(), gateway: deps.gateway.clone(), bus: deps.bus.clone() }),
        )
        .on(
            MessageKind::SecurityEvent,
            Arc::new(SecurityEventHandler {
                cache: deps.cache.clone(),
                gateway: deps.gateway.clone(),
                bus: deps.bus.clone(),
                audit: deps.audit.clone(),
            }),
        )
        .on(MessageKind::JobResult, Arc::new(JobResultHandler { jobs: deps.jobs.clone() }))
        .build()
}

fn unexpected(kind: MessageKind) -> KernelError {
    KernelError::InvalidRequest(format!("{kind} handler received another event"))
}

fn unknown_machine(machine_id: &str) -> KernelError {
    KernelError::NotFound { entity: "machine", id: machine_id.to_string() }
}

/// Persists the machine row off the message path. Runs under the machine's
/// write lock and only while the cache still holds the machine, so a late
/// write cannot bring a decommissioned machine back.
fn persist_in_background(
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<StateCache>,
    machine_id: MachineId,
    sample: Option<MetricSample>,
) {
    tokio::spawn(async move {
        let _writes = cache.lock_writes(&machine_id).await;
        // latest record, not the one this message produced
        let Some(machine) = cache.get(&machine_id) else {
            debug!(machine_id = %machine_id, "machine gone, background write skipped");
            return;
        };
        if let Some(sample) = sample {
            if let Err(e) = gateway.record_metric(&sample).await {
                warn!(machine_id = %machine_id, error = %e, "metric sample not persisted");
            }
        }
        if let Err(e) = gateway.upsert_machine(&machine).await {
            warn!(machine_id = %machine_id, error = %e, "machine row not persisted");
        }
    });
}

struct RegistrationHandler {
    inventory: Arc<Inventory>,
}

#[async_trait]
impl MessageHandler for RegistrationHandler {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()> {
        let NormalizedEvent::Registration(registration) = message.event else {
            return Err(unexpected(message.kind));
        };
        self.inventory.register_machine(&ctx.machine_id, registration).await?;
        Ok(())
    }
}

struct HeartbeatHandler {
    cache: Arc<StateCache>,
    gateway: Arc<dyn PersistenceGateway>,
    bus: EventBus,
}

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()> {
        let NormalizedEvent::Heartbeat { status } = message.event else {
            return Err(unexpected(message.kind));
        };
        let previous = self.cache.get(&ctx.machine_id).map(|m| m.status);
        let record = self
            .cache
            .touch(&ctx.machine_id, status, OffsetDateTime::now_utc())
            .ok_or_else(|| unknown_machine(&ctx.machine_id))?;
        if previous != Some(status) {
            debug!(machine_id = %ctx.machine_id, status = status.as_str(), "machine status changed");
            self.bus.publish(topics::MACHINES_UPDATED, record.as_ref());
        }
        persist_in_background(self.gateway.clone(), self.cache.clone(), record.id.clone(), None);
        Ok(())
    }
}

struct MetricHandler {
    cache: Arc<StateCache>,
    gateway: Arc<dyn PersistenceGateway>,
    bus: EventBus,
}

#[async_trait]
impl MessageHandler for MetricHandler {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()> {
        let NormalizedEvent::Metrics(snapshot) = message.event else {
            return Err(unexpected(message.kind));
        };
        let sample = MetricSample { machine_id: ctx.machine_id.clone(), snapshot: snapshot.clone() };
        let record = self
            .cache
            .upsert_from_metric(&ctx.machine_id, snapshot)
            .ok_or_else(|| unknown_machine(&ctx.machine_id))?;
        self.bus.publish(topics::MACHINES_UPDATED, record.as_ref());
        persist_in_background(self.gateway.clone(), self.cache.clone(), record.id.clone(), Some(sample));
        Ok(())
    }
}

struct SecurityEventHandler {
    cache: Arc<StateCache>,
    gateway: Arc<dyn PersistenceGateway>,
    bus: EventBus,
    audit: AuditSink,
}

impl SecurityEventHandler {
    async fn is_known(&self, machine_id: &str) -> KernelResult<bool> {
        if self.cache.is_ready() {
            return Ok(self.cache.contains(machine_id));
        }
        Ok(self.gateway.get_machine(machine_id).await?.is_some())
    }
}

#[async_trait]
impl MessageHandler for SecurityEventHandler {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()> {
        let NormalizedEvent::Security(finding) = message.event else {
            return Err(unexpected(message.kind));
        };
        let writes = self.cache.lock_writes(&ctx.machine_id).await;
        if !self.is_known(&ctx.machine_id).await? {
            return Err(unknown_machine(&ctx.machine_id));
        }
        let event = SecurityEvent {
            id: Uuid::new_v4().to_string(),
            machine_id: ctx.machine_id.clone(),
            category: finding.category,
            path: finding.path,
            severity: finding.severity,
            status: SecurityEventStatus::Open,
            description: finding.description,
            created_at: OffsetDateTime::now_utc(),
        };
        self.gateway.insert_security_event(&event).await?;
        self.cache.upsert_from_security_event(&ctx.machine_id, event.severity);
        drop(writes);
        self.bus.publish(topics::SECURITY_EVENT, &event);

        if event.severity >= Severity::High {
            self.audit.record(
                AuditRecord::new("security.event", event.category.clone(), event.severity)
                    .machine(ctx.machine_id.clone())
                    .details(serde_json::json!({
                        "event_id": event.id,
                        "path": event.path,
                        "reported_severity": finding.reported_severity,
                        "description": event.description,
                    })),
            );
        }
        Ok(())
    }
}

struct JobResultHandler {
    jobs: Arc<JobOrchestrator>,
}

#[async_trait]
impl MessageHandler for JobResultHandler {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()> {
        let NormalizedEvent::JobResult(report) = message.event else {
            return Err(unexpected(message.kind));
        };
        self.jobs.record_result(&ctx.machine_id, report).await?;
        Ok(())
    }
}
