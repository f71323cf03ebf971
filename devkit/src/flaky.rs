/*!
A [`PersistenceGateway`] that fails when told to.

Wraps a [`JsonStore`] and injects [`StoreError::Unavailable`] into reads,
writes or both. Read failures can be limited to the next `n` calls, which is
how warm-up retries are exercised.
*/

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sentinel_kernel::models::{
    AuditEntry, Group, GroupMember, Job, JobExecution, Machine, MetricSample, SecurityEvent,
};
use sentinel_kernel::store::{JsonStore, PersistenceGateway, StoreError, StoreResult};

pub struct FlakyGateway {
    inner: JsonStore,
    failing_reads: AtomicUsize,
    writes_down: AtomicBool,
    reads_seen: AtomicUsize,
}

impl Default for FlakyGateway {
    fn default() -> Self {
        Self::new(JsonStore::in_memory())
    }
}

impl FlakyGateway {
    pub fn new(inner: JsonStore) -> Self {
        Self {
            inner,
            failing_reads: AtomicUsize::new(0),
            writes_down: AtomicBool::new(false),
            reads_seen: AtomicUsize::new(0),
        }
    }

    /// The next `n` reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn set_writes_failing(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    /// Reads attempted so far, failed ones included.
    pub fn reads_seen(&self) -> usize {
        self.reads_seen.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &JsonStore {
        &self.inner
    }

    fn read(&self) -> StoreResult<()> {
        self.reads_seen.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn write(&self) -> StoreResult<()> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        self.read()?;
        self.inner.list_machines().await
    }

    async fn get_machine(&self, id: &str) -> StoreResult<Option<Machine>> {
        self.read()?;
        self.inner.get_machine(id).await
    }

    async fn upsert_machine(&self, machine: &Machine) -> StoreResult<()> {
        self.write()?;
        self.inner.upsert_machine(machine).await
    }

    async fn delete_machine(&self, id: &str) -> StoreResult<bool> {
        self.write()?;
        self.inner.delete_machine(id).await
    }

    async fn record_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        self.write()?;
        self.inner.record_metric(sample).await
    }

    async fn delete_metrics(&self, machine_id: &str) -> StoreResult<usize> {
        self.write()?;
        self.inner.delete_metrics(machine_id).await
    }

    async fn insert_group(&self, group: &Group) -> StoreResult<()> {
        self.write()?;
        self.inner.insert_group(group).await
    }

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        self.read()?;
        self.inner.get_group(id).await
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        self.read()?;
        self.inner.list_groups().await
    }

    async fn delete_group(&self, id: &str) -> StoreResult<bool> {
        self.write()?;
        self.inner.delete_group(id).await
    }

    async fn add_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<GroupMember> {
        self.write()?;
        self.inner.add_group_member(group_id, machine_id).await
    }

    async fn remove_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<bool> {
        self.write()?;
        self.inner.remove_group_member(group_id, machine_id).await
    }

    async fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<GroupMember>> {
        self.read()?;
        self.inner.list_group_members(group_id).await
    }

    async fn remove_memberships(&self, machine_id: &str) -> StoreResult<usize> {
        self.write()?;
        self.inner.remove_memberships(machine_id).await
    }

    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        self.write()?;
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        self.write()?;
        self.inner.update_job(job).await
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<Job>> {
        self.read()?;
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        self.read()?;
        self.inner.list_jobs().await
    }

    async fn delete_job(&self, id: &str) -> StoreResult<bool> {
        self.write()?;
        self.inner.delete_job(id).await
    }

    async fn insert_executions(&self, executions: &[JobExecution]) -> StoreResult<()> {
        self.write()?;
        self.inner.insert_executions(executions).await
    }

    async fn update_execution(&self, execution: &JobExecution) -> StoreResult<()> {
        self.write()?;
        self.inner.update_execution(execution).await
    }

    async fn list_executions(&self, job_id: &str) -> StoreResult<Vec<JobExecution>> {
        self.read()?;
        self.inner.list_executions(job_id).await
    }

    async fn delete_executions(&self, job_id: &str) -> StoreResult<usize> {
        self.write()?;
        self.inner.delete_executions(job_id).await
    }

    async fn insert_security_event(&self, event: &SecurityEvent) -> StoreResult<()> {
        self.write()?;
        self.inner.insert_security_event(event).await
    }

    async fn get_security_event(&self, id: &str) -> StoreResult<Option<SecurityEvent>> {
        self.read()?;
        self.inner.get_security_event(id).await
    }

    async fn update_security_event(&self, event: &SecurityEvent) -> StoreResult<()> {
        self.write()?;
        self.inner.update_security_event(event).await
    }

    async fn list_security_events(&self, machine_id: Option<&str>) -> StoreResult<Vec<SecurityEvent>> {
        self.read()?;
        self.inner.list_security_events(machine_id).await
    }

    async fn delete_security_events(&self, machine_id: &str) -> StoreResult<usize> {
        self.write()?;
        self.inner.delete_security_events(machine_id).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.write()?;
        self.inner.append_audit(entry).await
    }

    async fn list_audit(&self) -> StoreResult<Vec<AuditEntry>> {
        // assertions read the audit trail, keep it out of injected failures
        self.inner.list_audit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_failures_run_out() {
        let store = FlakyGateway::default();
        store.fail_next_reads(2);
        assert!(store.list_machines().await.is_err());
        assert!(store.get_machine("m1").await.is_err());
        assert!(store.list_machines().await.unwrap().is_empty());
        assert_eq!(store.reads_seen(), 3);
    }

    #[tokio::test]
    async fn writes_fail_until_restored() {
        let store = FlakyGateway::default();
        let machine = Machine::new("m1", "m1.lan", time::OffsetDateTime::now_utc());
        store.set_writes_failing(true);
        assert!(matches!(store.upsert_machine(&machine).await, Err(StoreError::Unavailable(_))));
        store.set_writes_failing(false);
        store.upsert_machine(&machine).await.unwrap();
        assert!(store.get_machine("m1").await.unwrap().is_some());
    }
}
