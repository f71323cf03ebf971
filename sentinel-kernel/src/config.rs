use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::protocol::normalizer::{default_rules, PathRule};

pub const CONFIG_ENV: &str = "SENTINEL_KERNEL_CONFIG";
pub const SECRET_ENV: &str = "SENTINEL_AGENT_SECRET";
pub const API_KEY_ENV: &str = "SENTINEL_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub store: StoreConf,
    pub security: SecurityConf,
    pub jobs: JobsConf,
    pub agents: AgentsConf,
    pub normalizer: NormalizerConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "sentinel-kernel".into(),
            topic_prefix: "sentinel".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    /// JSON document; in memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConf {
    pub clock_skew_secs: u64,
    pub replay_window_secs: u64,
    pub replay_capacity: usize,
    /// Filled from `SENTINEL_AGENT_SECRET`, never read from the file.
    #[serde(skip)]
    pub agent_secret: String,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for SecurityConf {
    fn default() -> Self {
        Self {
            clock_skew_secs: 300,
            replay_window_secs: 600,
            replay_capacity: 4096,
            agent_secret: String::new(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConf {
    pub execution_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for JobsConf {
    fn default() -> Self {
        Self { execution_timeout_secs: 300, sweep_interval_secs: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConf {
    pub offline_after_secs: u64,
    /// Per-connection inbound queue.
    pub queue_depth: usize,
}

impl Default for AgentsConf {
    fn default() -> Self {
        Self { offline_after_secs: 90, queue_depth: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConf {
    pub file_integrity_rules: Vec<PathRule>,
}

impl Default for NormalizerConf {
    fn default() -> Self {
        Self { file_integrity_rules: default_rules() }
    }
}

impl KernelConfig {
    pub fn from_yaml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Reads `$SENTINEL_KERNEL_CONFIG` (default `kernel.yaml`); a missing
    /// file means defaults. Secrets always come from the environment.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = PathBuf::from(std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into()));
        let mut config = if fs::try_exists(&path).await.unwrap_or(false) {
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
            info!(path = %path.display(), "config loaded");
            Self::from_yaml(&path, &text)?
        } else {
            warn!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.security.agent_secret = std::env::var(SECRET_ENV).unwrap_or_default();
        config.security.api_key = std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| Err(ConfigError::Invalid { field, reason: reason.to_string() });
        if self.security.agent_secret.is_empty() {
            return invalid("security.agent_secret", "set SENTINEL_AGENT_SECRET");
        }
        if self.security.clock_skew_secs == 0 {
            return invalid("security.clock_skew_secs", "must be positive");
        }
        // a message dated `skew` ahead stays fresh until `2 * skew` after arrival
        if self.security.replay_window_secs < self.security.clock_skew_secs.saturating_mul(2) {
            return invalid("security.replay_window_secs", "must be at least twice clock_skew_secs");
        }
        if self.jobs.execution_timeout_secs == 0 || self.jobs.sweep_interval_secs == 0 {
            return invalid("jobs", "timeouts and intervals must be positive");
        }
        if self.agents.offline_after_secs == 0 || self.agents.queue_depth == 0 {
            return invalid("agents", "threshold and queue depth must be positive");
        }
        if self.mqtt.topic_prefix.trim().is_empty() || self.mqtt.topic_prefix.contains(['+', '#']) {
            return invalid("mqtt.topic_prefix", "must be a plain topic level");
        }
        for rule in &self.normalizer.file_integrity_rules {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                return Err(ConfigError::Invalid { field: "normalizer.file_integrity_rules", reason: e.to_string() });
            }
        }
        Ok(())
    }
}
