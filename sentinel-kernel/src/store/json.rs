/*!
JSON-backed gateway.

All records live in one `StoreData` behind a `parking_lot::RwLock`; when a
file path is configured the whole document is rewritten after every
mutation. Writes to the file are serialized by an async mutex so the file
always ends up holding the latest state.
*/

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info};

use super::{PersistenceGateway, StoreError, StoreResult};
use crate::models::{
    AuditEntry, Group, GroupMember, Job, JobExecution, Machine, MetricSample, MetricSnapshot,
    SecurityEvent, SecuritySummary,
};

/// Metric rows kept per machine.
const METRIC_HISTORY: usize = 720;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    machines: HashMap<String, Machine>,
    metrics: HashMap<String, VecDeque<MetricSnapshot>>,
    groups: HashMap<String, Group>,
    members: Vec<GroupMember>,
    next_position: u64,
    jobs: HashMap<String, Job>,
    executions: Vec<JobExecution>,
    security_events: Vec<SecurityEvent>,
    audit: Vec<AuditEntry>,
}

pub struct JsonStore {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonStore {
    /// Store without a backing file.
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            path: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens (or creates on first write) the JSON document at `path`.
    pub async fn open<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        let path = path.into();
        let data = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                StoreData::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            info!(path = %path.display(), "no existing store file, starting fresh");
            StoreData::default()
        };
        info!(
            path = %path.display(),
            machines = data.machines.len(),
            jobs = data.jobs.len(),
            "store loaded"
        );
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn flush(&self) -> StoreResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let _guard = self.write_lock.lock().await;
        let content = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        debug!(path = %path.display(), "store flushed");
        Ok(())
    }

    fn not_found(entity: &'static str, id: &str) -> StoreError {
        StoreError::NotFound { entity, id: id.to_string() }
    }
}

#[async_trait]
impl PersistenceGateway for JsonStore {
    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let mut machines: Vec<Machine> = self.data.read().machines.values().cloned().collect();
        machines.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> StoreResult<Option<Machine>> {
        Ok(self.data.read().machines.get(id).cloned())
    }

    async fn upsert_machine(&self, machine: &Machine) -> StoreResult<()> {
        {
            let mut row = machine.clone();
            // the summary is derived from security events, never stored
            row.security = SecuritySummary::default();
            self.data.write().machines.insert(row.id.clone(), row);
        }
        self.flush().await
    }

    async fn delete_machine(&self, id: &str) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write();
            if data.metrics.get(id).is_some_and(|rows| !rows.is_empty()) {
                return Err(StoreError::Constraint(format!(
                    "machine {id} still has metric rows"
                )));
            }
            data.machines.remove(id).is_some()
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn record_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            if !data.machines.contains_key(&sample.machine_id) {
                return Err(Self::not_found("machine", &sample.machine_id));
            }
            let rows = data.metrics.entry(sample.machine_id.clone()).or_default();
            rows.push_back(sample.snapshot.clone());
            while rows.len() > METRIC_HISTORY {
                rows.pop_front();
            }
        }
        self.flush().await
    }

    async fn delete_metrics(&self, machine_id: &str) -> StoreResult<usize> {
        let removed = self
            .data
            .write()
            .metrics
            .remove(machine_id)
            .map_or(0, |rows| rows.len());
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn insert_group(&self, group: &Group) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            if data.groups.contains_key(&group.id) {
                return Err(StoreError::Constraint(format!("group {} already exists", group.id)));
            }
            data.groups.insert(group.id.clone(), group.clone());
        }
        self.flush().await
    }

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        Ok(self.data.read().groups.get(id).cloned())
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let mut groups: Vec<Group> = self.data.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(groups)
    }

    async fn delete_group(&self, id: &str) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write();
            if data.members.iter().any(|m| m.group_id == id) {
                return Err(StoreError::Constraint(format!("group {id} still has members")));
            }
            data.groups.remove(id).is_some()
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn add_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<GroupMember> {
        let member = {
            let mut data = self.data.write();
            if !data.groups.contains_key(group_id) {
                return Err(Self::not_found("group", group_id));
            }
            if let Some(existing) = data
                .members
                .iter()
                .find(|m| m.group_id == group_id && m.machine_id == machine_id)
            {
                return Ok(existing.clone());
            }
            let member = GroupMember {
                group_id: group_id.to_string(),
                machine_id: machine_id.to_string(),
                position: data.next_position,
            };
            data.next_position += 1;
            data.members.push(member.clone());
            member
        };
        self.flush().await?;
        Ok(member)
    }

    async fn remove_group_member(&self, group_id: &str, machine_id: &str) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write();
            let before = data.members.len();
            data.members
                .retain(|m| !(m.group_id == group_id && m.machine_id == machine_id));
            before != data.members.len()
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<GroupMember>> {
        let mut members: Vec<GroupMember> = self
            .data
            .read()
            .members
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.position);
        Ok(members)
    }

    async fn remove_memberships(&self, machine_id: &str) -> StoreResult<usize> {
        let removed = {
            let mut data = self.data.write();
            let before = data.members.len();
            data.members.retain(|m| m.machine_id != machine_id);
            before - data.members.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            if data.jobs.contains_key(&job.id) {
                return Err(StoreError::Constraint(format!("job {} already exists", job.id)));
            }
            data.jobs.insert(job.id.clone(), job.clone());
        }
        self.flush().await
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            let Some(row) = data.jobs.get_mut(&job.id) else {
                return Err(Self::not_found("job", &job.id));
            };
            *row = job.clone();
        }
        self.flush().await
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<Job>> {
        Ok(self.data.read().jobs.get(id).cloned())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.data.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write();
            if data.executions.iter().any(|e| e.job_id == id) {
                return Err(StoreError::Constraint(format!("job {id} still has executions")));
            }
            data.jobs.remove(id).is_some()
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn insert_executions(&self, executions: &[JobExecution]) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            for execution in executions {
                if !data.jobs.contains_key(&execution.job_id) {
                    return Err(Self::not_found("job", &execution.job_id));
                }
            }
            data.executions.extend(executions.iter().cloned());
        }
        self.flush().await
    }

    async fn update_execution(&self, execution: &JobExecution) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            let Some(row) = data.executions.iter_mut().find(|e| e.id == execution.id) else {
                return Err(Self::not_found("execution", &execution.id));
            };
            *row = execution.clone();
        }
        self.flush().await
    }

    async fn list_executions(&self, job_id: &str) -> StoreResult<Vec<JobExecution>> {
        Ok(self
            .data
            .read()
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn delete_executions(&self, job_id: &str) -> StoreResult<usize> {
        let removed = {
            let mut data = self.data.write();
            let before = data.executions.len();
            data.executions.retain(|e| e.job_id != job_id);
            before - data.executions.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn insert_security_event(&self, event: &SecurityEvent) -> StoreResult<()> {
        self.data.write().security_events.push(event.clone());
        self.flush().await
    }

    async fn get_security_event(&self, id: &str) -> StoreResult<Option<SecurityEvent>> {
        Ok(self
            .data
            .read()
            .security_events
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn update_security_event(&self, event: &SecurityEvent) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            let Some(row) = data.security_events.iter_mut().find(|e| e.id == event.id) else {
                return Err(Self::not_found("security event", &event.id));
            };
            *row = event.clone();
        }
        self.flush().await
    }

    async fn list_security_events(&self, machine_id: Option<&str>) -> StoreResult<Vec<SecurityEvent>> {
        Ok(self
            .data
            .read()
            .security_events
            .iter()
            .filter(|e| machine_id.map_or(true, |id| e.machine_id == id))
            .cloned()
            .collect())
    }

    async fn delete_security_events(&self, machine_id: &str) -> StoreResult<usize> {
        let removed = {
            let mut data = self.data.write();
            let before = data.security_events.len();
            data.security_events.retain(|e| e.machine_id != machine_id);
            before - data.security_events.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.data.write().audit.push(entry.clone());
        self.flush().await
    }

    async fn list_audit(&self) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.data.read().audit.clone())
    }
}
