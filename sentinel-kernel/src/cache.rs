/*!
State cache - in-memory mirror of machine state.

Lifecycle: `uninitialized → warming → ready`. Until the first full load from
the gateway completes, [`StateCache::is_ready`] is false and readers go
through [`StateCache::list_machines`], which falls back to the gateway and
builds the very same views.

Each machine lives in its own slot holding an `Arc<Machine>`; writers of one
machine serialize on that slot's mutex and swap the whole record, readers
clone the `Arc`. The slot index is only locked for lookups and inserts, so a
slow writer on one machine never delays reads or writes on another.
*/

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::models::{
    Machine, MachineId, MachineStatus, MetricSnapshot, SecurityEvent, SecuritySummary, Severity,
};
use crate::store::{PersistenceGateway, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePhase {
    Uninitialized,
    Warming,
    Ready,
}

struct Slot {
    record: Mutex<Arc<Machine>>,
}

impl Slot {
    fn new(machine: Machine) -> Arc<Self> {
        Arc::new(Self { record: Mutex::new(Arc::new(machine)) })
    }

    fn load(&self) -> Arc<Machine> {
        self.record.lock().clone()
    }
}

pub struct StateCache {
    phase: RwLock<CachePhase>,
    slots: RwLock<HashMap<MachineId, Arc<Slot>>>,
    warm_lock: tokio::sync::Mutex<()>,
    write_locks: Mutex<HashMap<MachineId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(CachePhase::Uninitialized),
            slots: RwLock::new(HashMap::new()),
            warm_lock: tokio::sync::Mutex::new(()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> CachePhase {
        *self.phase.read()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == CachePhase::Ready
    }

    /// Full initial load. Idempotent; after a failure the cache goes back to
    /// `uninitialized` and the call may be retried.
    pub async fn warm(&self, gateway: &dyn PersistenceGateway) -> Result<usize, StoreError> {
        let _guard = self.warm_lock.lock().await;
        if self.is_ready() {
            return Ok(self.len());
        }
        *self.phase.write() = CachePhase::Warming;

        let loaded = match gateway.list_machines().await {
            Ok(machines) => match gateway.list_security_events(None).await {
                Ok(events) => Ok(build_views(machines, &events)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match loaded {
            Ok(views) => {
                let count = views.len();
                {
                    let mut slots = self.slots.write();
                    for view in views {
                        // registrations that raced the warm-up already hold fresher data
                        slots.entry(view.id.clone()).or_insert_with(|| Slot::new(view));
                    }
                }
                *self.phase.write() = CachePhase::Ready;
                info!(machines = count, "state cache warm");
                Ok(count)
            }
            Err(e) => {
                *self.phase.write() = CachePhase::Uninitialized;
                warn!(error = %e, "state cache warm-up failed");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Machine>> {
        let slot = self.slots.read().get(id).cloned()?;
        Some(slot.load())
    }

    /// Snapshot ordered by creation time ascending.
    pub fn machines(&self) -> Vec<Arc<Machine>> {
        let slots: Vec<Arc<Slot>> = self.slots.read().values().cloned().collect();
        let mut machines: Vec<Arc<Machine>> = slots.iter().map(|slot| slot.load()).collect();
        machines.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        machines
    }

    /// Read path for callers: the cache once warm, the gateway before that.
    pub async fn list_machines(
        &self,
        gateway: &dyn PersistenceGateway,
    ) -> Result<Vec<Arc<Machine>>, StoreError> {
        if self.is_ready() {
            return Ok(self.machines());
        }
        debug!("state cache cold, reading machines from the gateway");
        let machines = gateway.list_machines().await?;
        let events = gateway.list_security_events(None).await?;
        Ok(build_views(machines, &events).into_iter().map(Arc::new).collect())
    }

    /// Inserts a machine, or refreshes the identity fields of a known one while
    /// keeping its creation time, metrics and security summary.
    pub fn insert_machine(&self, machine: Machine) -> Arc<Machine> {
        let existing = {
            let mut slots = self.slots.write();
            match slots.entry(machine.id.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let slot = Slot::new(machine);
                    let record = slot.load();
                    entry.insert(slot);
                    return record;
                }
            }
        };
        let mut record = existing.record.lock();
        let mut next = (**record).clone();
        next.hostname = machine.hostname;
        next.ip = machine.ip;
        next.os = machine.os;
        next.status = machine.status;
        next.last_seen = machine.last_seen.max(next.last_seen);
        let next = Arc::new(next);
        *record = next.clone();
        next
    }

    /// Evicts a machine and its summary. Absent ids are a no-op.
    pub fn delete_machine(&self, id: &str) -> bool {
        self.evict(id).is_some()
    }

    /// Like [`StateCache::delete_machine`], handing back the evicted record.
    pub fn evict(&self, id: &str) -> Option<Arc<Machine>> {
        let slot = self.slots.write().remove(id)?;
        debug!(machine_id = id, "machine evicted from cache");
        Some(slot.load())
    }

    /// Serializes gateway writes of one machine's row against its removal.
    /// Holders check [`StateCache::contains`] after acquiring.
    pub async fn lock_writes(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self.write_locks.lock().entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Last-write-wins metrics. Unknown machines are dropped.
    pub fn upsert_from_metric(&self, id: &str, snapshot: MetricSnapshot) -> Option<Arc<Machine>> {
        let updated = self.update(id, |machine| {
            machine.last_seen = machine.last_seen.max(Some(snapshot.collected_at));
            if machine.status == MachineStatus::Offline {
                machine.status = MachineStatus::Online;
            }
            machine.metrics = Some(snapshot);
        });
        if updated.is_none() {
            warn!(machine_id = id, "metric for unknown machine dropped");
        }
        updated
    }

    /// Folds one more open event into the summary without rescanning.
    pub fn upsert_from_security_event(&self, id: &str, severity: Severity) -> Option<Arc<Machine>> {
        let updated = self.update(id, |machine| machine.security.absorb(severity));
        if updated.is_none() {
            warn!(machine_id = id, %severity, "security event for unknown machine dropped");
        }
        updated
    }

    pub fn replace_security_summary(&self, id: &str, summary: SecuritySummary) -> Option<Arc<Machine>> {
        self.update(id, |machine| machine.security = summary)
    }

    /// Heartbeat: status plus liveness.
    pub fn touch(&self, id: &str, status: MachineStatus, at: OffsetDateTime) -> Option<Arc<Machine>> {
        self.update(id, |machine| {
            machine.status = status;
            machine.last_seen = machine.last_seen.max(Some(at));
        })
    }

    pub fn set_status(&self, id: &str, status: MachineStatus) -> Option<Arc<Machine>> {
        self.update(id, |machine| machine.status = status)
    }

    /// Marks every machine silent since before `cutoff` as offline.
    pub fn mark_offline_stale(&self, cutoff: OffsetDateTime) -> Vec<MachineId> {
        let mut marked = Vec::new();
        for machine in self.machines() {
            let stale = machine.status != MachineStatus::Offline
                && machine.last_seen.is_some_and(|seen| seen < cutoff);
            if stale && self.set_status(&machine.id, MachineStatus::Offline).is_some() {
                marked.push(machine.id.clone());
            }
        }
        if !marked.is_empty() {
            info!(count = marked.len(), "machines marked offline after silence");
        }
        marked
    }

    fn update<F: FnOnce(&mut Machine)>(&self, id: &str, apply: F) -> Option<Arc<Machine>> {
        let slot = self.slots.read().get(id).cloned()?;
        let mut record = slot.record.lock();
        let mut next = (**record).clone();
        apply(&mut next);
        let next = Arc::new(next);
        *record = next.clone();
        Some(next)
    }
}

/// Machine views with their security summary, in canonical order. Shared by
/// the warm-up and the cold read path so both return identical data.
pub fn build_views(mut machines: Vec<Machine>, events: &[SecurityEvent]) -> Vec<Machine> {
    let mut summaries: HashMap<&str, SecuritySummary> = HashMap::new();
    for event in events.iter().filter(|e| e.status.is_active()) {
        summaries
            .entry(event.machine_id.as_str())
            .or_default()
            .absorb(event.severity);
    }
    for machine in &mut machines {
        machine.security = summaries.remove(machine.id.as_str()).unwrap_or_default();
    }
    machines.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    machines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SecurityEventStatus;
    use crate::store::JsonStore;
    use time::macros::datetime;
    use time::Duration;

    fn machine(id: &str, minute: i64) -> Machine {
        let mut m = Machine::new(id, format!("{id}.lan"), datetime!(2026-01-01 00:00 UTC) + Duration::minutes(minute));
        m.status = MachineStatus::Online;
        m.last_seen = Some(m.created_at);
        m
    }

    fn snapshot(value: f64) -> MetricSnapshot {
        MetricSnapshot {
            cpu_percent: value,
            ram_percent: value,
            disk_percent: value,
            uptime_seconds: value as u64,
            collected_at: datetime!(2026-01-02 00:00 UTC),
        }
    }

    fn event(machine_id: &str, severity: Severity, status: SecurityEventStatus) -> SecurityEvent {
        SecurityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id: machine_id.into(),
            category: "process".into(),
            path: None,
            severity,
            status,
            description: "test".into(),
            created_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    async fn seeded_store() -> JsonStore {
        let store = JsonStore::in_memory();
        for (id, minute) in [("c", 3), ("a", 1), ("b", 2)] {
            store.upsert_machine(&machine(id, minute)).await.unwrap();
        }
        store
            .insert_security_event(&event("a", Severity::Medium, SecurityEventStatus::Open))
            .await
            .unwrap();
        store
            .insert_security_event(&event("a", Severity::Critical, SecurityEventStatus::Resolved))
            .await
            .unwrap();
        store
    }

    fn ids(machines: &[Arc<Machine>]) -> Vec<String> {
        machines.iter().map(|m| m.id.clone()).collect()
    }

    #[tokio::test]
    async fn warm_and_cold_reads_are_identical() {
        let store = seeded_store().await;
        let cache = StateCache::new();

        let cold = cache.list_machines(&store).await.unwrap();
        assert!(!cache.is_ready());
        assert_eq!(cache.warm(&store).await.unwrap(), 3);
        let warm = cache.list_machines(&store).await.unwrap();

        assert_eq!(ids(&warm), vec!["a", "b", "c"]);
        assert_eq!(cold, warm);
        // resolved events do not count
        assert_eq!(warm[0].security, SecuritySummary { open_count: 1, highest: Some(Severity::Medium) });
    }

    #[tokio::test]
    async fn warm_is_idempotent() {
        let store = seeded_store().await;
        let cache = StateCache::new();
        cache.warm(&store).await.unwrap();
        cache.upsert_from_metric("a", snapshot(10.0)).unwrap();
        cache.warm(&store).await.unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").unwrap().metrics.is_some());
    }

    #[test]
    fn severity_aggregation_is_incremental() {
        let cache = StateCache::new();
        cache.insert_machine(machine("m1", 0));
        for severity in [Severity::Low, Severity::High, Severity::Critical, Severity::Low] {
            cache.upsert_from_security_event("m1", severity).unwrap();
        }
        let summary = cache.get("m1").unwrap().security.clone();
        assert_eq!(summary.open_count, 4);
        assert_eq!(summary.highest, Some(Severity::Critical));
    }

    #[test]
    fn unknown_machine_updates_are_dropped() {
        let cache = StateCache::new();
        assert!(cache.upsert_from_metric("ghost", snapshot(1.0)).is_none());
        assert!(cache.upsert_from_security_event("ghost", Severity::High).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = StateCache::new();
        cache.insert_machine(machine("m1", 0));
        assert!(cache.delete_machine("m1"));
        assert!(!cache.delete_machine("m1"));
        assert!(cache.get("m1").is_none());
    }

    #[tokio::test]
    async fn write_lock_is_per_machine() {
        let cache = StateCache::new();
        let held = cache.lock_writes("m1").await;
        let _other = cache.lock_writes("m2").await;
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), cache.lock_writes("m1")).await;
        assert!(waiting.is_err());
        drop(held);
        let _again = cache.lock_writes("m1").await;
    }

    #[test]
    fn registration_refresh_keeps_derived_state() {
        let cache = StateCache::new();
        cache.insert_machine(machine("m1", 0));
        cache.upsert_from_metric("m1", snapshot(42.0));
        cache.upsert_from_security_event("m1", Severity::High);

        let mut renamed = machine("m1", 30);
        renamed.hostname = "renamed.lan".into();
        let record = cache.insert_machine(renamed);

        assert_eq!(record.hostname, "renamed.lan");
        assert_eq!(record.created_at, datetime!(2026-01-01 00:00 UTC));
        assert_eq!(record.metrics.as_ref().unwrap().cpu_percent, 42.0);
        assert_eq!(record.security.open_count, 1);
    }

    #[test]
    fn stale_machines_go_offline() {
        let cache = StateCache::new();
        cache.insert_machine(machine("old", 0));
        cache.insert_machine(machine("fresh", 60));
        let marked = cache.mark_offline_stale(datetime!(2026-01-01 00:30 UTC));
        assert_eq!(marked, vec!["old".to_string()]);
        assert_eq!(cache.get("old").unwrap().status, MachineStatus::Offline);
        assert_eq!(cache.get("fresh").unwrap().status, MachineStatus::Online);
    }

    #[test]
    fn readers_never_see_half_written_records() {
        let cache = Arc::new(StateCache::new());
        cache.insert_machine(machine("m1", 0));
        cache.insert_machine(machine("m2", 1));

        let writers: Vec<_> = ["m1", "m2"]
            .into_iter()
            .map(|id| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        cache.upsert_from_metric(id, snapshot(i as f64));
                    }
                })
            })
            .collect();

        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    for machine in cache.machines() {
                        if let Some(m) = &machine.metrics {
                            assert_eq!(m.cpu_percent, m.ram_percent);
                            assert_eq!(m.ram_percent, m.disk_percent);
                        }
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(cache.get("m1").unwrap().metrics.as_ref().unwrap().cpu_percent, 1_999.0);
    }
}
