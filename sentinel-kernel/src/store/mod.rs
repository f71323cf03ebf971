/*!
Persistence gateway - the durable system of record consumed by the core.

The kernel never talks to a database directly: every durable read or write
goes through [`PersistenceGateway`]. The bundled [`JsonStore`] keeps the
records in memory and optionally mirrors them to a JSON file, which is enough
for a single kernel and for tests. Other backends only need to implement the
trait.

Cascade ordering is part of the contract: metric rows go before their machine
and executions before their job. Implementations reject the reverse order
with [`StoreError::Constraint`].
*/

mod json;

pub use json::JsonStore;

use async_trait::async_trait;

use crate::models::{
    AuditEntry, Group, GroupMember, Job, JobExecution, Machine, MetricSample, SecurityEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Machines ordered by `created_at` ascending, id as tie breaker.
    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;
    async fn get_machine(&self, id: &str) -> StoreResult<Option<Machine>>;
    async fn upsert_machine(&self, machine: &Machine) -> StoreResult<()>;
    /// Fails with a constraint error while metric rows still reference the machine.
    async fn delete_machine(&self, id: &str) -> StoreResult<bool>;

    async fn record_metric(&self, sample: &MetricSample) -> StoreResult<()>;
    async fn delete_metrics(&self, machine_id: &str) -> StoreResult<usize>;

    async fn insert_group(&self, group: &Group) -> StoreResult<()>;
    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>>;
    async fn list_groups(&self) -> StoreResult<Vec<Group>>;
    /// Fails with a constraint error while members remain.
    async fn delete_group(&self, id: &str) -> StoreResult<bool>;
    /// Idempotent: adding an existing member returns the existing row.
    async fn add_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<GroupMember>;
    async fn remove_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<bool>;
    /// Members ordered by insertion position.
    async fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<GroupMember>>;
    async fn remove_memberships(&self, machine_id: &str) -> StoreResult<usize>;

    async fn insert_job(&self, job: &Job) -> StoreResult<()>;
    async fn update_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, id: &str) -> StoreResult<Option<Job>>;
    /// Jobs ordered by `created_at` ascending.
    async fn list_jobs(&self) -> StoreResult<Vec<Job>>;
    /// Fails with a constraint error while executions remain.
    async fn delete_job(&self, id: &str) -> StoreResult<bool>;

    async fn insert_executions(&self, executions: &[JobExecution]) -> StoreResult<()>;
    async fn update_execution(&self, execution: &JobExecution) -> StoreResult<()>;
    /// Executions of a job in insertion order.
    async fn list_executions(&self, job_id: &str) -> StoreResult<Vec<JobExecution>>;
    async fn delete_executions(&self, job_id: &str) -> StoreResult<usize>;

    async fn insert_security_event(&self, event: &SecurityEvent) -> StoreResult<()>;
    async fn get_security_event(&self, id: &str) -> StoreResult<Option<SecurityEvent>>;
    async fn update_security_event(&self, event: &SecurityEvent) -> StoreResult<()>;
    /// All events, or only those of one machine, in insertion order.
    async fn list_security_events(&self, machine_id: Option<&str>) -> StoreResult<Vec<SecurityEvent>>;
    async fn delete_security_events(&self, machine_id: &str) -> StoreResult<usize>;

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;
    async fn list_audit(&self) -> StoreResult<Vec<AuditEntry>>;
}
