use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::topics;
use crate::cache::CachePhase;
use crate::protocol::PipelineCounters;
use crate::state::Kernel;

pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub cache_phase: String,
    pub machines_tracked: u32,
    pub connected_agents: u32,
    pub live_jobs: u32,
    pub pipeline: PipelineCounters,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, kernel: &Kernel) -> KernelHealth {
        let phase = match kernel.cache.phase() {
            CachePhase::Uninitialized => "uninitialized",
            CachePhase::Warming => "warming",
            CachePhase::Ready => "ready",
        };
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cache_phase: phase.to_string(),
            machines_tracked: kernel.cache.len() as u32,
            connected_agents: kernel.presence.count() as u32,
            live_jobs: kernel.jobs.live_job_count() as u32,
            pipeline: kernel.pipeline.stats(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Publishes `kernel.health` on the bus every [`PUBLISH_INTERVAL`]; the MQTT
/// bridge carries it to the broker.
pub fn spawn_health_publisher(kernel: Arc<Kernel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
        loop {
            interval.tick().await;
            let health = kernel.health.get_health(&kernel);
            debug!(uptime = health.uptime_seconds, machines = health.machines_tracked, "kernel health published");
            kernel.bus.publish(topics::KERNEL_HEALTH, &health);
        }
    })
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
