/*!
A complete kernel on an in-memory store.

Messages are fed straight into the pipeline (or through a connection task
with [`TestHarness::spawn_connection`]); outbound traffic lands in
[`RecordingConnections`].
*/

use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sentinel_kernel::config::KernelConfig;
use sentinel_kernel::connections::Presence;
use sentinel_kernel::models::{AuditEntry, Machine};
use sentinel_kernel::mqtt::run_connection;
use sentinel_kernel::protocol::{ConnectionContext, PipelineOutcome};
use sentinel_kernel::store::PersistenceGateway;
use sentinel_kernel::Kernel;

use crate::agent::AgentStub;
use crate::connections::RecordingConnections;
use crate::flaky::FlakyGateway;

pub const TEST_SECRET: &str = "devkit-shared-secret";

pub struct TestHarness {
    pub kernel: Arc<Kernel>,
    pub connections: Arc<RecordingConnections>,
    pub store: Arc<FlakyGateway>,
}

impl TestHarness {
    /// Wired and warmed.
    pub async fn new() -> Result<Self> {
        let harness = Self::cold(FlakyGateway::default())?;
        harness.kernel.cache.warm(harness.kernel.gateway.as_ref()).await?;
        Ok(harness)
    }

    /// Wired over `store`, cache left uninitialized. Needs a tokio runtime.
    pub fn cold(store: FlakyGateway) -> Result<Self> {
        init_tracing();
        let store = Arc::new(store);
        let connections = Arc::new(RecordingConnections::new());
        let gateway: Arc<dyn PersistenceGateway> = store.clone();
        let kernel = Kernel::build(Self::config(), gateway, connections.clone(), Presence::default())?;
        Ok(Self { kernel, connections, store })
    }

    pub fn config() -> KernelConfig {
        let mut config = KernelConfig::default();
        config.security.agent_secret = TEST_SECRET.to_string();
        config.security.api_key = Some("devkit-api-key".to_string());
        config
    }

    pub fn agent(&self, machine_id: &str) -> AgentStub {
        AgentStub::new(machine_id, TEST_SECRET)
    }

    /// Runs one message through the pipeline as if it arrived on `machine_id`'s connection.
    pub async fn deliver(&self, machine_id: &str, raw: &[u8]) -> PipelineOutcome {
        self.kernel.pipeline.process(&ConnectionContext::new(machine_id), raw).await
    }

    /// Registers the agent and marks it connected.
    pub async fn register(&self, agent: &AgentStub, ip: &str) -> Result<Arc<Machine>> {
        let outcome = self.deliver(agent.machine_id(), &agent.registration(ip)).await;
        if !matches!(outcome, PipelineOutcome::Handled(_)) {
            bail!("registration of {} not handled: {outcome:?}", agent.machine_id());
        }
        self.connections.connect(agent.machine_id());
        match self.kernel.cache.get(agent.machine_id()) {
            Some(machine) => Ok(machine),
            None => bail!("{} missing from the cache after registration", agent.machine_id()),
        }
    }

    /// Starts a connection task for `machine_id` fed by the returned sender.
    pub fn spawn_connection(&self, machine_id: &str, presence: Presence) -> (mpsc::Sender<Vec<u8>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_connection(
            self.kernel.pipeline.clone(),
            presence,
            ConnectionContext::new(machine_id),
            rx,
        ));
        (tx, task)
    }

    pub async fn audit_entries(&self, action: &str) -> Result<Vec<AuditEntry>> {
        let entries = self.store.list_audit().await?;
        Ok(entries.into_iter().filter(|entry| entry.action == action).collect())
    }
}

/// Polls `check` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_kernel::cache::CachePhase;
    use sentinel_kernel::connections::ConnectionRegistry;
    use sentinel_kernel::models::MachineStatus;

    #[tokio::test]
    async fn registered_agents_are_cached_and_connected() {
        let harness = TestHarness::new().await.unwrap();
        assert_eq!(harness.kernel.cache.phase(), CachePhase::Ready);

        let agent = harness.agent("m1");
        let machine = harness.register(&agent, "10.0.0.1").await.unwrap();
        assert_eq!(machine.hostname, "m1.lan");
        assert_eq!(machine.status, MachineStatus::Online);
        assert!(harness.connections.is_connected("m1"));
        assert!(harness.store.get_machine("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(30), || async { false }).await);
        assert!(wait_until(Duration::from_millis(30), || async { true }).await);
    }
}
