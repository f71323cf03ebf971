/*!
Job orchestrator.

A job fans out into one execution per resolved machine. While any execution
is still open the job is "live": its state sits behind a per-job async mutex
so that results, aborts, dispatch bookkeeping and timeouts for the same job
are applied one at a time, each together with its gateway write. Once every
execution is terminal (or the job is aborted) the live entry is closed and
removed; anything arriving later is discarded.

```text
job:        PENDING → RUNNING → COMPLETED | FAILED | ABORTED
execution:  PENDING → RUNNING → COMPLETED | FAILED     (ABORTED from any open state)
```
*/

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::bus::{topics, EventBus};
use crate::cache::StateCache;
use crate::connections::{ConnectionRegistry, OutboundMessage};
use crate::error::{KernelError, KernelResult};
use crate::models::{
    ExecutionId, ExecutionStatus, Job, JobExecution, JobId, JobStatus, MachineStatus, Severity,
};
use crate::resolver::{ResolveError, TargetResolver, TargetSpec};
use crate::store::PersistenceGateway;

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub execution_timeout_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self { execution_timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub executions: Vec<JobExecution>,
}

impl JobView {
    pub fn execution_for(&self, machine_id: &str) -> Option<&JobExecution> {
        self.executions.iter().find(|e| e.machine_id == machine_id)
    }
}

/// What an agent reports about one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Applied,
    /// Late or unknown: the execution or its job was already closed.
    Discarded,
}

struct LiveState {
    job: Job,
    executions: Vec<JobExecution>,
    closed: bool,
}

impl LiveState {
    fn view(&self) -> JobView {
        JobView { job: self.job.clone(), executions: self.executions.clone() }
    }

    fn execution_mut(&mut self, id: &str) -> Option<&mut JobExecution> {
        self.executions.iter_mut().find(|e| e.id == id)
    }

    fn all_terminal(&self) -> bool {
        self.executions.iter().all(|e| e.status.is_terminal())
    }
}

struct LiveJob {
    state: tokio::sync::Mutex<LiveState>,
}

impl LiveJob {
    fn new(job: Job, executions: Vec<JobExecution>) -> Arc<Self> {
        Arc::new(Self { state: tokio::sync::Mutex::new(LiveState { job, executions, closed: false }) })
    }
}

pub struct JobOrchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<StateCache>,
    resolver: Arc<TargetResolver>,
    connections: Arc<dyn ConnectionRegistry>,
    bus: EventBus,
    audit: AuditSink,
    settings: JobSettings,
    live: Mutex<HashMap<JobId, Arc<LiveJob>>>,
}

impl JobOrchestrator {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        cache: Arc<StateCache>,
        resolver: Arc<TargetResolver>,
        connections: Arc<dyn ConnectionRegistry>,
        bus: EventBus,
        audit: AuditSink,
        settings: JobSettings,
    ) -> Self {
        Self {
            gateway,
            cache,
            resolver,
            connections,
            bus,
            audit,
            settings,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_job_count(&self) -> usize {
        self.live.lock().len()
    }

    pub async fn create_job(
        &self,
        command: &str,
        target: TargetSpec,
        actor: Option<&str>,
    ) -> KernelResult<JobView> {
        let command = command.trim();
        if command.is_empty() {
            return Err(KernelError::InvalidRequest("command must not be empty".into()));
        }
        let mut job = Job {
            id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            status: JobStatus::Pending,
            target: target.clone(),
            reason: None,
            created_at: OffsetDateTime::now_utc(),
            finished_at: None,
        };
        self.gateway.insert_job(&job).await?;
        info!(job_id = %job.id, command = %job.command, "job created");
        let mut record = AuditRecord::new("job.create", "job", Severity::Info)
            .details(json!({ "job_id": job.id, "command": job.command }));
        if let Some(actor) = actor {
            record = record.actor(actor);
        }
        self.audit.record(record);

        let machines = match self.resolver.resolve(&target, &self.cache, self.gateway.as_ref()).await {
            Ok(machines) => machines,
            Err(ResolveError::Store(e)) => return Err(e.into()),
            Err(e) => return self.fail_unresolved(job, e.to_string()).await,
        };
        if machines.is_empty() {
            return self.fail_unresolved(job, KernelError::TargetResolutionEmpty.to_string()).await;
        }

        let executions: Vec<JobExecution> = machines
            .iter()
            .map(|machine| JobExecution {
                id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                machine_id: machine.id.clone(),
                status: ExecutionStatus::Pending,
                output: None,
                exit_code: None,
                error: None,
                started_at: None,
                finished_at: None,
            })
            .collect();
        self.gateway.insert_executions(&executions).await?;
        job.status = JobStatus::Running;
        self.gateway.update_job(&job).await?;

        let live = LiveJob::new(job.clone(), executions.clone());
        self.live.lock().insert(job.id.clone(), live.clone());
        self.publish_job(&job);

        let argv = shell_words::split(&job.command).map_err(|e| format!("invalid command: {e}"));
        let offline: HashSet<&str> = machines
            .iter()
            .filter(|m| m.status == MachineStatus::Offline)
            .map(|m| m.id.as_str())
            .collect();
        let command = job.command.as_str();
        let dispatches = executions.iter().map(|execution| {
            let argv = argv.clone();
            let offline = offline.contains(execution.machine_id.as_str());
            async move {
                let outcome = self.dispatch(execution, command, argv, offline).await;
                (execution.id.clone(), outcome)
            }
        });
        let outcomes = join_all(dispatches).await;
        self.apply_dispatch(&live, outcomes).await;

        let view = live.state.lock().await.view();
        Ok(view)
    }

    async fn dispatch(
        &self,
        execution: &JobExecution,
        command: &str,
        argv: Result<Vec<String>, String>,
        offline: bool,
    ) -> Result<(), String> {
        if offline || !self.connections.is_connected(&execution.machine_id) {
            return Err("machine offline".into());
        }
        let message = OutboundMessage::Execute {
            job_id: execution.job_id.clone(),
            execution_id: execution.id.clone(),
            command: command.to_string(),
            argv: argv?,
            timeout_secs: self.settings.execution_timeout_secs,
        };
        self.connections
            .send(&execution.machine_id, message)
            .await
            .map_err(|e| e.to_string())
    }

    async fn apply_dispatch(&self, live: &LiveJob, outcomes: Vec<(ExecutionId, Result<(), String>)>) {
        let mut state = live.state.lock().await;
        if state.closed {
            return;
        }
        let now = OffsetDateTime::now_utc();
        for (execution_id, outcome) in outcomes {
            let Some(execution) = state.execution_mut(&execution_id) else {
                continue;
            };
            // a result or an abort may already have landed
            if execution.status != ExecutionStatus::Pending {
                continue;
            }
            match outcome {
                Ok(()) => {
                    execution.status = ExecutionStatus::Running;
                    execution.started_at = Some(now);
                }
                Err(reason) => {
                    let failure = KernelError::DispatchFailure {
                        machine_id: execution.machine_id.clone(),
                        reason: reason.clone(),
                    };
                    warn!(job_id = %execution.job_id, error = %failure, "execution not dispatched");
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(reason);
                    execution.finished_at = Some(now);
                }
            }
            let execution = execution.clone();
            self.persist_execution(&execution).await;
        }
        self.finish_if_done(&mut state).await;
    }

    async fn fail_unresolved(&self, mut job: Job, reason: String) -> KernelResult<JobView> {
        warn!(job_id = %job.id, %reason, "job failed before dispatch");
        job.status = JobStatus::Failed;
        job.reason = Some(reason);
        job.finished_at = Some(OffsetDateTime::now_utc());
        self.gateway.update_job(&job).await?;
        self.publish_job(&job);
        Ok(JobView { job, executions: Vec::new() })
    }

    /// Applies an agent's report. Reports for executions owned by another
    /// machine are rejected; reports for closed executions are discarded.
    pub async fn record_result(
        &self,
        machine_id: &str,
        report: ExecutionReport,
    ) -> KernelResult<ResultOutcome> {
        let live = self.live.lock().get(&report.job_id).cloned();
        let Some(live) = live else {
            debug!(job_id = %report.job_id, execution_id = %report.execution_id, "result for a finished or unknown job discarded");
            return Ok(ResultOutcome::Discarded);
        };
        let mut state = live.state.lock().await;
        if state.closed {
            debug!(job_id = %report.job_id, "result after job close discarded");
            return Ok(ResultOutcome::Discarded);
        }
        let now = OffsetDateTime::now_utc();
        let Some(execution) = state.execution_mut(&report.execution_id) else {
            debug!(job_id = %report.job_id, execution_id = %report.execution_id, "result for unknown execution discarded");
            return Ok(ResultOutcome::Discarded);
        };
        if execution.machine_id != machine_id {
            warn!(execution_id = %execution.id, owner = %execution.machine_id, reporter = machine_id, "result from foreign machine rejected");
            return Err(KernelError::ValidationFailure {
                reason: format!("execution {} is not owned by {machine_id}", execution.id),
            });
        }
        if execution.status.is_terminal() {
            debug!(execution_id = %execution.id, status = ?execution.status, "late result discarded");
            return Ok(ResultOutcome::Discarded);
        }
        match report.status {
            ExecutionStatus::Running => {
                if execution.status == ExecutionStatus::Running {
                    return Ok(ResultOutcome::Applied);
                }
                execution.status = ExecutionStatus::Running;
                execution.started_at.get_or_insert(now);
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                execution.status = report.status;
                execution.output = report.output;
                execution.exit_code = report.exit_code;
                execution.error = report.error;
                execution.started_at.get_or_insert(now);
                execution.finished_at = Some(now);
            }
            ExecutionStatus::Pending | ExecutionStatus::Aborted => {
                return Err(KernelError::ValidationFailure {
                    reason: format!("agents cannot report status {:?}", report.status),
                });
            }
        }
        let execution = execution.clone();
        self.persist_execution(&execution).await;
        self.finish_if_done(&mut state).await;
        Ok(ResultOutcome::Applied)
    }

    /// Idempotent. Open executions become ABORTED and are cancelled on a best
    /// effort basis; the job itself stays ABORTED whatever arrives later.
    pub async fn abort_job(&self, id: &str, actor: Option<&str>) -> KernelResult<JobView> {
        let tracked = self.live.lock().get(id).cloned();
        let live = match tracked {
            Some(live) => live,
            None => {
                let job = self
                    .gateway
                    .get_job(id)
                    .await?
                    .ok_or_else(|| KernelError::NotFound { entity: "job", id: id.to_string() })?;
                let executions = self.gateway.list_executions(id).await?;
                if job.status.is_terminal() {
                    return Ok(JobView { job, executions });
                }
                // open in the store but not tracked here, e.g. after a restart
                let live = LiveJob::new(job, executions);
                self.live.lock().entry(id.to_string()).or_insert(live).clone()
            }
        };

        let (view, aborted) = {
            let mut state = live.state.lock().await;
            if state.closed {
                return Ok(state.view());
            }
            let now = OffsetDateTime::now_utc();
            // live state changes only after every write went through
            let aborted: Vec<JobExecution> = state
                .executions
                .iter()
                .filter(|e| !e.status.is_terminal())
                .map(|e| JobExecution {
                    status: ExecutionStatus::Aborted,
                    error: Some("aborted".into()),
                    finished_at: Some(now),
                    ..e.clone()
                })
                .collect();
            let job = Job {
                status: JobStatus::Aborted,
                reason: Some("aborted".into()),
                finished_at: Some(now),
                ..state.job.clone()
            };
            for execution in &aborted {
                self.gateway.update_execution(execution).await?;
            }
            self.gateway.update_job(&job).await?;

            for execution in &aborted {
                if let Some(slot) = state.execution_mut(&execution.id) {
                    *slot = execution.clone();
                }
                self.bus.publish(topics::JOBS_EXECUTION, execution);
            }
            state.job = job;
            state.closed = true;
            self.live.lock().remove(id);
            (state.view(), aborted)
        };

        let cancels = aborted.iter().map(|execution| async move {
            let message = OutboundMessage::Cancel {
                job_id: execution.job_id.clone(),
                execution_id: execution.id.clone(),
            };
            if let Err(e) = self.connections.send(&execution.machine_id, message).await {
                debug!(machine_id = %execution.machine_id, error = %e, "cancel not delivered");
            }
        });
        join_all(cancels).await;

        info!(job_id = id, aborted = aborted.len(), "job aborted");
        let mut record = AuditRecord::new("job.abort", "job", Severity::Medium).details(json!({
            "job_id": id,
            "forced": true,
            "aborted_executions": aborted.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        }));
        if let Some(actor) = actor {
            record = record.actor(actor);
        }
        self.audit.record(record);
        self.publish_job(&view.job);
        Ok(view)
    }

    /// Live state when the job is open, persisted state otherwise.
    pub async fn get_job(&self, id: &str) -> KernelResult<Option<JobView>> {
        let tracked = self.live.lock().get(id).cloned();
        if let Some(live) = tracked {
            return Ok(Some(live.state.lock().await.view()));
        }
        let Some(job) = self.gateway.get_job(id).await? else {
            return Ok(None);
        };
        let executions = self.gateway.list_executions(id).await?;
        Ok(Some(JobView { job, executions }))
    }

    pub async fn list_jobs(&self) -> KernelResult<Vec<Job>> {
        Ok(self.gateway.list_jobs().await?)
    }

    /// Aborts first when still open, then removes executions before the job.
    pub async fn delete_job(&self, id: &str, actor: Option<&str>) -> KernelResult<()> {
        let job = self
            .gateway
            .get_job(id)
            .await?
            .ok_or_else(|| KernelError::NotFound { entity: "job", id: id.to_string() })?;
        if !job.status.is_terminal() {
            self.abort_job(id, actor).await?;
        }
        let removed = self.gateway.delete_executions(id).await?;
        self.gateway.delete_job(id).await?;
        info!(job_id = id, executions = removed, "job deleted");
        self.bus.publish(topics::JOBS_STATUS, &json!({ "job_id": id, "status": "DELETED" }));
        Ok(())
    }

    pub async fn expand_target(&self, spec: &TargetSpec) -> KernelResult<TargetSpec> {
        Ok(self.resolver.expand(spec, self.gateway.as_ref()).await?)
    }

    /// Fails RUNNING executions that outlived the execution timeout.
    pub async fn expire_overdue(&self, now: OffsetDateTime) -> usize {
        let cutoff = now - Duration::seconds(self.settings.execution_timeout_secs as i64);
        let tracked: Vec<Arc<LiveJob>> = self.live.lock().values().cloned().collect();
        let mut expired_total = 0;
        for live in tracked {
            let mut state = live.state.lock().await;
            if state.closed {
                continue;
            }
            let mut expired = Vec::new();
            for execution in state.executions.iter_mut() {
                let overdue = execution.status == ExecutionStatus::Running
                    && execution.started_at.is_some_and(|started| started < cutoff);
                if overdue {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some("execution timed out".into());
                    execution.finished_at = Some(now);
                    expired.push(execution.clone());
                }
            }
            for execution in &expired {
                warn!(job_id = %execution.job_id, machine_id = %execution.machine_id, "execution timed out");
                self.persist_execution(execution).await;
            }
            expired_total += expired.len();
            self.finish_if_done(&mut state).await;
        }
        expired_total
    }

    async fn persist_execution(&self, execution: &JobExecution) {
        if let Err(e) = self.gateway.update_execution(execution).await {
            warn!(execution_id = %execution.id, error = %e, "execution update not persisted");
        }
        self.bus.publish(topics::JOBS_EXECUTION, execution);
    }

    async fn finish_if_done(&self, state: &mut LiveState) {
        if state.closed || !state.all_terminal() {
            return;
        }
        let total = state.executions.len();
        let completed = state
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count();
        let aborted = state.executions.iter().any(|e| e.status == ExecutionStatus::Aborted);
        if aborted {
            state.job.status = JobStatus::Aborted;
            state.job.reason = Some("aborted".into());
        } else if completed == total {
            state.job.status = JobStatus::Completed;
        } else {
            state.job.status = JobStatus::Failed;
            state.job.reason = Some(format!("{} of {total} executions did not complete", total - completed));
        }
        state.job.finished_at = Some(OffsetDateTime::now_utc());
        state.closed = true;
        if let Err(e) = self.gateway.update_job(&state.job).await {
            warn!(job_id = %state.job.id, error = %e, "final job status not persisted");
        }
        self.live.lock().remove(&state.job.id);
        info!(job_id = %state.job.id, status = ?state.job.status, "job finished");
        self.publish_job(&state.job);
    }

    fn publish_job(&self, job: &Job) {
        self.bus.publish(
            topics::JOBS_STATUS,
            &json!({ "job_id": job.id, "status": job.status, "reason": job.reason }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionError;
    use crate::models::Machine;
    use crate::store::JsonStore;
    use async_trait::async_trait;
    use time::macros::datetime;

    #[derive(Default)]
    struct Loopback {
        connected: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, OutboundMessage)>>,
    }

    #[async_trait]
    impl ConnectionRegistry for Loopback {
        async fn send(&self, machine_id: &str, message: OutboundMessage) -> Result<(), ConnectionError> {
            if !self.is_connected(machine_id) {
                return Err(ConnectionError::NotConnected(machine_id.to_string()));
            }
            self.sent.lock().push((machine_id.to_string(), message));
            Ok(())
        }

        fn is_connected(&self, machine_id: &str) -> bool {
            self.connected.lock().contains(machine_id)
        }
    }

    struct Fixture {
        store: Arc<JsonStore>,
        links: Arc<Loopback>,
        jobs: JobOrchestrator,
    }

    async fn fixture(machines: &[(&str, bool)]) -> Fixture {
        let store = Arc::new(JsonStore::in_memory());
        let cache = Arc::new(StateCache::new());
        let links = Arc::new(Loopback::default());
        for (i, (id, connected)) in machines.iter().enumerate() {
            let mut machine =
                Machine::new(*id, format!("{id}.lan"), datetime!(2026-02-01 00:00 UTC) + Duration::minutes(i as i64));
            machine.status = MachineStatus::Online;
            store.upsert_machine(&machine).await.unwrap();
            if *connected {
                links.connected.lock().insert(id.to_string());
            }
        }
        cache.warm(store.as_ref()).await.unwrap();
        let bus = EventBus::new(64);
        let audit = AuditSink::new(store.clone(), bus.clone());
        let jobs = JobOrchestrator::new(
            store.clone(),
            cache,
            Arc::new(TargetResolver::default()),
            links.clone(),
            bus,
            audit,
            JobSettings::default(),
        );
        Fixture { store, links, jobs }
    }

    fn report(view: &JobView, machine_id: &str, status: ExecutionStatus) -> ExecutionReport {
        ExecutionReport {
            job_id: view.job.id.clone(),
            execution_id: view.execution_for(machine_id).unwrap().id.clone(),
            status,
            output: Some("ok".into()),
            exit_code: Some(0),
            error: None,
        }
    }

    #[tokio::test]
    async fn disconnected_target_fails_the_job() {
        let fx = fixture(&[("m1", true), ("m2", false)]).await;
        let view = fx.jobs.create_job("uptime", TargetSpec::machines(["m1", "m2"]), None).await.unwrap();

        assert_eq!(view.job.status, JobStatus::Running);
        assert_eq!(view.execution_for("m1").unwrap().status, ExecutionStatus::Running);
        assert_eq!(view.execution_for("m2").unwrap().status, ExecutionStatus::Failed);

        let outcome = fx.jobs.record_result("m1", report(&view, "m1", ExecutionStatus::Completed)).await.unwrap();
        assert_eq!(outcome, ResultOutcome::Applied);

        let done = fx.jobs.get_job(&view.job.id).await.unwrap().unwrap();
        assert_eq!(done.job.status, JobStatus::Failed);
        assert_eq!(done.execution_for("m1").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(fx.jobs.live_job_count(), 0);
        assert_eq!(fx.store.get_job(&view.job.id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn all_completed_means_completed() {
        let fx = fixture(&[("m1", true), ("m2", true)]).await;
        let view = fx.jobs.create_job("echo 'hi there'", TargetSpec::machines(["m1", "m2"]), None).await.unwrap();

        let sent = fx.links.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        match &sent[0].1 {
            OutboundMessage::Execute { argv, .. } => assert_eq!(argv, &vec!["echo".to_string(), "hi there".into()]),
            other => panic!("unexpected message {other:?}"),
        }

        for id in ["m1", "m2"] {
            fx.jobs.record_result(id, report(&view, id, ExecutionStatus::Completed)).await.unwrap();
        }
        let done = fx.jobs.get_job(&view.job.id).await.unwrap().unwrap();
        assert_eq!(done.job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn empty_target_fails_with_reason() {
        let fx = fixture(&[("m1", true)]).await;
        let view = fx.jobs.create_job("uptime", TargetSpec::machines(["ghost"]), None).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert_eq!(view.job.reason.as_deref(), Some("no targets resolved"));
        assert!(view.executions.is_empty());
    }

    #[tokio::test]
    async fn invalid_query_fails_the_job() {
        let fx = fixture(&[("m1", true)]).await;
        let view = fx
            .jobs
            .create_job("uptime", TargetSpec::query(json!({"nope": 1})), None)
            .await
            .unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert!(view.job.reason.unwrap().contains("unknown field"));
    }

    #[tokio::test]
    async fn abort_is_sticky_and_idempotent() {
        let fx = fixture(&[("m1", true), ("m2", true)]).await;
        let view = fx.jobs.create_job("sleep 60", TargetSpec::machines(["m1", "m2"]), None).await.unwrap();
        fx.jobs.record_result("m1", report(&view, "m1", ExecutionStatus::Completed)).await.unwrap();

        let aborted = fx.jobs.abort_job(&view.job.id, Some("ops")).await.unwrap();
        assert_eq!(aborted.job.status, JobStatus::Aborted);
        assert_eq!(aborted.execution_for("m1").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(aborted.execution_for("m2").unwrap().status, ExecutionStatus::Aborted);
        assert_eq!(fx.jobs.live_job_count(), 0);

        let late = fx.jobs.record_result("m2", report(&view, "m2", ExecutionStatus::Completed)).await.unwrap();
        assert_eq!(late, ResultOutcome::Discarded);

        let again = fx.jobs.abort_job(&view.job.id, None).await.unwrap();
        assert_eq!(again.job.status, JobStatus::Aborted);
        assert_eq!(again.execution_for("m2").unwrap().status, ExecutionStatus::Aborted);

        let cancels = fx
            .links
            .sent
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::Cancel { .. }))
            .count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn foreign_results_are_rejected() {
        let fx = fixture(&[("m1", true), ("m2", true)]).await;
        let view = fx.jobs.create_job("uptime", TargetSpec::machines(["m1", "m2"]), None).await.unwrap();
        let err = fx
            .jobs
            .record_result("m2", report(&view, "m1", ExecutionStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ValidationFailure { .. }));
        let current = fx.jobs.get_job(&view.job.id).await.unwrap().unwrap();
        assert_eq!(current.execution_for("m1").unwrap().status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn overdue_executions_time_out() {
        let fx = fixture(&[("m1", true)]).await;
        let view = fx.jobs.create_job("uptime", TargetSpec::machines(["m1"]), None).await.unwrap();
        assert_eq!(fx.jobs.expire_overdue(OffsetDateTime::now_utc()).await, 0);
        let later = OffsetDateTime::now_utc() + Duration::seconds(301);
        assert_eq!(fx.jobs.expire_overdue(later).await, 1);
        let done = fx.jobs.get_job(&view.job.id).await.unwrap().unwrap();
        assert_eq!(done.job.status, JobStatus::Failed);
        assert_eq!(done.executions[0].error.as_deref(), Some("execution timed out"));
    }

    #[tokio::test]
    async fn delete_cascades_after_abort() {
        let fx = fixture(&[("m1", true)]).await;
        let view = fx.jobs.create_job("uptime", TargetSpec::machines(["m1"]), None).await.unwrap();
        fx.jobs.delete_job(&view.job.id, None).await.unwrap();
        assert!(fx.jobs.get_job(&view.job.id).await.unwrap().is_none());
        assert!(fx.store.list_executions(&view.job.id).await.unwrap().is_empty());
        assert!(matches!(
            fx.jobs.delete_job(&view.job.id, None).await,
            Err(KernelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn empty_command_is_refused() {
        let fx = fixture(&[("m1", true)]).await;
        assert!(matches!(
            fx.jobs.create_job("   ", TargetSpec::machines(["m1"]), None).await,
            Err(KernelError::InvalidRequest(_))
        ));
    }
}
