//! Machine and group management on top of the gateway, keeping the state
//! cache and the event bus in step with every write.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::bus::{topics, EventBus};
use crate::cache::StateCache;
use crate::error::{KernelError, KernelResult};
use crate::models::{
    Group, GroupMember, GroupType, Machine, MachineId, MachineStatus, SecurityEvent, SecurityEventStatus,
    SecuritySummary, Severity,
};
use crate::protocol::messages::RegistrationPayload;
use crate::resolver::{TargetResolver, TargetSpec};
use crate::store::PersistenceGateway;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GroupDefinition {
    Static(Vec<MachineId>),
    Dynamic(Value),
}

pub struct Inventory {
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<StateCache>,
    resolver: Arc<TargetResolver>,
    bus: EventBus,
    audit: AuditSink,
}

fn not_found(entity: &'static str, id: &str) -> KernelError {
    KernelError::NotFound { entity, id: id.to_string() }
}

impl Inventory {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        cache: Arc<StateCache>,
        resolver: Arc<TargetResolver>,
        bus: EventBus,
        audit: AuditSink,
    ) -> Self {
        Self { gateway, cache, resolver, bus, audit }
    }

    /// Creates the machine or refreshes it, keeping `created_at` and metrics.
    pub async fn register_machine(
        &self,
        machine_id: &str,
        registration: RegistrationPayload,
    ) -> KernelResult<Arc<Machine>> {
        let now = OffsetDateTime::now_utc();
        let writes = self.cache.lock_writes(machine_id).await;
        let existing = self.gateway.get_machine(machine_id).await?;
        let first_time = existing.is_none();
        let mut machine = existing.unwrap_or_else(|| Machine::new(machine_id, registration.hostname.clone(), now));
        machine.hostname = registration.hostname;
        machine.ip = registration.ip;
        machine.os = registration.os;
        machine.status = MachineStatus::Online;
        machine.last_seen = Some(now);
        self.gateway.upsert_machine(&machine).await?;

        let record = self.cache.insert_machine(machine);
        drop(writes);
        info!(machine_id, hostname = %record.hostname, first_time, agent_version = ?registration.agent_version, "machine registered");
        self.bus.publish(topics::MACHINES_UPDATED, record.as_ref());
        if first_time {
            self.audit.record(
                AuditRecord::new("machine.register", "inventory", Severity::Info)
                    .machine(machine_id)
                    .details(json!({ "hostname": record.hostname })),
            );
        }
        Ok(record)
    }

    /// Removes everything that references the machine, then the machine.
    ///
    /// The cache entry goes first, under the machine's write lock, so no
    /// metric or event can land between the deletes. It is put back if the
    /// gateway fails half way.
    pub async fn decommission_machine(&self, machine_id: &str, actor: Option<&str>) -> KernelResult<()> {
        let _writes = self.cache.lock_writes(machine_id).await;
        let machine = self
            .gateway
            .get_machine(machine_id)
            .await?
            .ok_or_else(|| not_found("machine", machine_id))?;
        let evicted = self.cache.evict(machine_id);
        let (metrics, events, memberships) = match self.purge(machine_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(machine_id, error = %e, "decommission interrupted, cache entry restored");
                if let Some(record) = evicted {
                    self.cache.insert_machine((*record).clone());
                }
                return Err(e);
            }
        };

        info!(machine_id, metrics, events, memberships, "machine decommissioned");
        let mut record = AuditRecord::new("machine.decommission", "inventory", Severity::Medium)
            .machine(machine_id)
            .details(json!({ "hostname": machine.hostname, "metrics": metrics, "events": events }));
        if let Some(actor) = actor {
            record = record.actor(actor);
        }
        self.audit.append(record).await;
        self.bus.publish(topics::MACHINES_DELETED, &json!({ "id": machine_id }));
        Ok(())
    }

    async fn purge(&self, machine_id: &str) -> KernelResult<(usize, usize, usize)> {
        let metrics = self.gateway.delete_metrics(machine_id).await?;
        let events = self.gateway.delete_security_events(machine_id).await?;
        let memberships = self.gateway.remove_memberships(machine_id).await?;
        self.gateway.delete_machine(machine_id).await?;
        Ok((metrics, events, memberships))
    }

    pub async fn create_group(
        &self,
        name: &str,
        description: Option<String>,
        definition: GroupDefinition,
    ) -> KernelResult<Group> {
        if name.trim().is_empty() {
            return Err(KernelError::InvalidRequest("group name must not be empty".into()));
        }
        let (group_type, query, members) = match definition {
            GroupDefinition::Dynamic(query) => {
                // broken predicates are refused here rather than at first use
                self.resolver.compile(Some(&query))?;
                let stored = match query {
                    Value::String(raw) => raw,
                    other => other.to_string(),
                };
                (GroupType::Dynamic, Some(stored), Vec::new())
            }
            GroupDefinition::Static(ids) => (GroupType::Static, None, ids),
        };
        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description,
            group_type,
            query,
            created_at: OffsetDateTime::now_utc(),
        };
        self.gateway.insert_group(&group).await?;
        for machine_id in &members {
            self.gateway.add_group_member(&group.id, machine_id).await?;
        }
        info!(group_id = %group.id, name = %group.name, group_type = ?group.group_type, "group created");
        self.bus.publish(topics::GROUPS_UPDATED, &group);
        Ok(group)
    }

    pub async fn get_group(&self, group_id: &str) -> KernelResult<Group> {
        self.gateway
            .get_group(group_id)
            .await?
            .ok_or_else(|| not_found("group", group_id))
    }

    pub async fn list_groups(&self) -> KernelResult<Vec<Group>> {
        Ok(self.gateway.list_groups().await?)
    }

    async fn static_group(&self, group_id: &str) -> KernelResult<Group> {
        let group = self.get_group(group_id).await?;
        if group.group_type != GroupType::Static {
            return Err(KernelError::InvalidRequest(format!("group {group_id} is dynamic, its members are computed")));
        }
        Ok(group)
    }

    pub async fn add_member(&self, group_id: &str, machine_id: &str) -> KernelResult<GroupMember> {
        self.static_group(group_id).await?;
        if self.gateway.get_machine(machine_id).await?.is_none() {
            return Err(not_found("machine", machine_id));
        }
        let member = self.gateway.add_group_member(group_id, machine_id).await?;
        self.bus.publish(topics::GROUPS_UPDATED, &json!({ "id": group_id, "added": machine_id }));
        Ok(member)
    }

    pub async fn remove_member(&self, group_id: &str, machine_id: &str) -> KernelResult<bool> {
        self.static_group(group_id).await?;
        let removed = self.gateway.remove_group_member(group_id, machine_id).await?;
        if removed {
            self.bus.publish(topics::GROUPS_UPDATED, &json!({ "id": group_id, "removed": machine_id }));
        }
        Ok(removed)
    }

    pub async fn members(&self, group_id: &str) -> KernelResult<Vec<GroupMember>> {
        self.static_group(group_id).await?;
        Ok(self.gateway.list_group_members(group_id).await?)
    }

    pub async fn delete_group(&self, group_id: &str) -> KernelResult<()> {
        let group = self.get_group(group_id).await?;
        for member in self.gateway.list_group_members(&group.id).await? {
            self.gateway.remove_group_member(&group.id, &member.machine_id).await?;
        }
        self.gateway.delete_group(&group.id).await?;
        info!(group_id, "group deleted");
        self.bus.publish(topics::GROUPS_UPDATED, &json!({ "id": group_id, "deleted": true }));
        Ok(())
    }

    /// Current machines of a group, dynamic queries evaluated right now.
    pub async fn resolve_group(&self, group_id: &str) -> KernelResult<Vec<Arc<Machine>>> {
        Ok(self
            .resolver
            .resolve(&TargetSpec::group(group_id), &self.cache, self.gateway.as_ref())
            .await?)
    }

    /// Moves an event through open → ack → resolved and recomputes the
    /// machine's summary from the stored events.
    pub async fn set_security_event_status(
        &self,
        event_id: &str,
        status: SecurityEventStatus,
    ) -> KernelResult<SecurityEvent> {
        let mut event = self
            .gateway
            .get_security_event(event_id)
            .await?
            .ok_or_else(|| not_found("security event", event_id))?;
        event.status = status;
        self.gateway.update_security_event(&event).await?;

        let events = self.gateway.list_security_events(Some(&event.machine_id)).await?;
        let summary = SecuritySummary::from_severities(
            events.iter().filter(|e| e.status.is_active()).map(|e| e.severity),
        );
        self.cache.replace_security_summary(&event.machine_id, summary);
        self.bus.publish(topics::SECURITY_EVENT, &event);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use crate::models::OsInfo;

    async fn inventory() -> (Arc<JsonStore>, Arc<StateCache>, Inventory) {
        let store = Arc::new(JsonStore::in_memory());
        let cache = Arc::new(StateCache::new());
        cache.warm(store.as_ref()).await.unwrap();
        let bus = EventBus::new(32);
        let audit = AuditSink::new(store.clone(), bus.clone());
        let inventory = Inventory::new(store.clone(), cache.clone(), Arc::new(TargetResolver::default()), bus, audit);
        (store, cache, inventory)
    }

    fn registration(hostname: &str) -> RegistrationPayload {
        RegistrationPayload {
            hostname: hostname.into(),
            ip: Some("10.0.0.7".into()),
            os: OsInfo { family: "linux".into(), version: Some("6.8".into()), arch: Some("x86_64".into()) },
            agent_version: Some("1.2.0".into()),
        }
    }

    #[tokio::test]
    async fn reregistration_keeps_creation_time() {
        let (store, cache, inventory) = inventory().await;
        let first = inventory.register_machine("m1", registration("db-1")).await.unwrap();
        let second = inventory.register_machine("m1", registration("db-1-renamed")).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(cache.get("m1").unwrap().hostname, "db-1-renamed");
        assert_eq!(store.list_machines().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broken_dynamic_query_is_refused_at_creation() {
        let (_, _, inventory) = inventory().await;
        let err = inventory
            .create_group("bad", None, GroupDefinition::Dynamic(json!({"version": 1, "where": {"field": "mood", "op": "eq", "value": 1}})))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn dynamic_group_tracks_cache_state() {
        let (_, cache, inventory) = inventory().await;
        inventory.register_machine("m1", registration("a")).await.unwrap();
        inventory.register_machine("m2", registration("b")).await.unwrap();
        let group = inventory
            .create_group("online", None, GroupDefinition::Dynamic(json!({"status": "online"})))
            .await
            .unwrap();
        assert_eq!(inventory.resolve_group(&group.id).await.unwrap().len(), 2);

        cache.set_status("m1", MachineStatus::Offline);
        let resolved = inventory.resolve_group(&group.id).await.unwrap();
        assert_eq!(resolved.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["m2"]);

        assert!(matches!(inventory.members(&group.id).await, Err(KernelError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn static_group_membership_and_deletion() {
        let (store, _, inventory) = inventory().await;
        inventory.register_machine("m1", registration("a")).await.unwrap();
        inventory.register_machine("m2", registration("b")).await.unwrap();
        let group = inventory
            .create_group("pinned", Some("hand picked".into()), GroupDefinition::Static(vec!["m2".into()]))
            .await
            .unwrap();
        inventory.add_member(&group.id, "m1").await.unwrap();
        assert!(matches!(inventory.add_member(&group.id, "ghost").await, Err(KernelError::NotFound { .. })));

        let members: Vec<String> = inventory.members(&group.id).await.unwrap().into_iter().map(|m| m.machine_id).collect();
        assert_eq!(members, vec!["m2", "m1"]);

        assert!(inventory.remove_member(&group.id, "m2").await.unwrap());
        inventory.delete_group(&group.id).await.unwrap();
        assert!(store.get_group(&group.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decommission_cascades() {
        let (store, cache, inventory) = inventory().await;
        inventory.register_machine("m1", registration("a")).await.unwrap();
        let group = inventory
            .create_group("pinned", None, GroupDefinition::Static(vec!["m1".into()]))
            .await
            .unwrap();
        store
            .record_metric(&crate::models::MetricSample {
                machine_id: "m1".into(),
                snapshot: crate::models::MetricSnapshot {
                    cpu_percent: 1.0,
                    ram_percent: 1.0,
                    disk_percent: 1.0,
                    uptime_seconds: 1,
                    collected_at: OffsetDateTime::now_utc(),
                },
            })
            .await
            .unwrap();

        inventory.decommission_machine("m1", Some("ops")).await.unwrap();
        assert!(cache.get("m1").is_none());
        assert!(store.get_machine("m1").await.unwrap().is_none());
        assert!(store.list_group_members(&group.id).await.unwrap().is_empty());
        assert!(store.list_audit().await.unwrap().iter().any(|e| e.action == "machine.decommission"));
        assert!(matches!(
            inventory.decommission_machine("m1", None).await,
            Err(KernelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolving_an_event_lowers_the_summary() {
        let (store, cache, inventory) = inventory().await;
        inventory.register_machine("m1", registration("a")).await.unwrap();
        let event = SecurityEvent {
            id: "e1".into(),
            machine_id: "m1".into(),
            category: "process".into(),
            path: None,
            severity: Severity::Critical,
            status: SecurityEventStatus::Open,
            description: "miner".into(),
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_security_event(&event).await.unwrap();
        cache.upsert_from_security_event("m1", Severity::Critical);

        inventory.set_security_event_status("e1", SecurityEventStatus::Ack).await.unwrap();
        assert_eq!(cache.get("m1").unwrap().security.open_count, 1);
        inventory.set_security_event_status("e1", SecurityEventStatus::Resolved).await.unwrap();
        assert_eq!(cache.get("m1").unwrap().security, SecuritySummary::default());
    }
}
