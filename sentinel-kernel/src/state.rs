//! The wired kernel: every shared component, built once and handed around as
//! `Arc<Kernel>`.

use std::sync::Arc;
use time::Duration;

use crate::audit::AuditSink;
use crate::bus::EventBus;
use crate::cache::StateCache;
use crate::config::KernelConfig;
use crate::connections::{ConnectionRegistry, Presence};
use crate::health::HealthTracker;
use crate::inventory::Inventory;
use crate::jobs::{JobOrchestrator, JobSettings};
use crate::protocol::handlers::{self, HandlerDeps};
use crate::protocol::normalizer::Normalizer;
use crate::protocol::router::RouterError;
use crate::protocol::validator::{Validator, ValidatorSettings};
use crate::protocol::Pipeline;
use crate::resolver::TargetResolver;
use crate::store::PersistenceGateway;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("file integrity rule: {0}")]
    Rules(#[from] regex::Error),
}

pub struct Kernel {
    pub config: KernelConfig,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub cache: Arc<StateCache>,
    pub resolver: Arc<TargetResolver>,
    pub bus: EventBus,
    pub audit: AuditSink,
    pub inventory: Arc<Inventory>,
    pub jobs: Arc<JobOrchestrator>,
    pub pipeline: Arc<Pipeline>,
    pub connections: Arc<dyn ConnectionRegistry>,
    pub presence: Presence,
    pub health: HealthTracker,
}

impl Kernel {
    /// Wires the components. Needs a running tokio runtime (the audit
    /// worker is spawned here); the cache is left cold.
    pub fn build(
        config: KernelConfig,
        gateway: Arc<dyn PersistenceGateway>,
        connections: Arc<dyn ConnectionRegistry>,
        presence: Presence,
    ) -> Result<Arc<Self>, BuildError> {
        let bus = EventBus::new(BUS_CAPACITY);
        let cache = Arc::new(StateCache::new());
        let resolver = Arc::new(TargetResolver::default());
        let audit = AuditSink::new(gateway.clone(), bus.clone());

        let inventory = Arc::new(Inventory::new(
            gateway.clone(),
            cache.clone(),
            resolver.clone(),
            bus.clone(),
            audit.clone(),
        ));
        let jobs = Arc::new(JobOrchestrator::new(
            gateway.clone(),
            cache.clone(),
            resolver.clone(),
            connections.clone(),
            bus.clone(),
            audit.clone(),
            JobSettings { execution_timeout_secs: config.jobs.execution_timeout_secs },
        ));

        let router = handlers::router(&HandlerDeps {
            gateway: gateway.clone(),
            cache: cache.clone(),
            inventory: inventory.clone(),
            jobs: jobs.clone(),
            bus: bus.clone(),
            audit: audit.clone(),
        })?;
        let validator = Validator::new(ValidatorSettings {
            secret: config.security.agent_secret.clone().into_bytes(),
            clock_skew: Duration::seconds(config.security.clock_skew_secs as i64),
            replay_window: Duration::seconds(config.security.replay_window_secs as i64),
            replay_capacity: config.security.replay_capacity,
        });
        let normalizer = Normalizer::new(&config.normalizer.file_integrity_rules)?;
        let pipeline = Arc::new(Pipeline::new(validator, router, normalizer, audit.clone()));

        Ok(Arc::new(Self {
            config,
            gateway,
            cache,
            resolver,
            bus,
            audit,
            inventory,
            jobs,
            pipeline,
            connections,
            presence,
            health: HealthTracker::new(),
        }))
    }
}
