//! Domain records shared by the cache, the store gateway, the orchestrator
//! and the protocol pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::resolver::TargetSpec;

pub type MachineId = String;
pub type JobId = String;
pub type ExecutionId = String;
pub type GroupId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Offline,
    Online,
    Degraded,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Offline => "offline",
            MachineStatus::Online => "online",
            MachineStatus::Degraded => "degraded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offline" => Some(MachineStatus::Offline),
            "online" => Some(MachineStatus::Online),
            "degraded" => Some(MachineStatus::Degraded),
            _ => None,
        }
    }
}

/// Security severity, totally ordered `info < low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub family: String,
    pub version: Option<String>,
    pub arch: Option<String>,
}

/// Latest metrics of a machine, already normalized to percents and seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

/// Open/ack security events aggregated per machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub open_count: u32,
    pub highest: Option<Severity>,
}

impl SecuritySummary {
    /// O(1) fold of one more open event.
    pub fn absorb(&mut self, severity: Severity) {
        self.open_count += 1;
        if self.highest.map_or(true, |current| severity > current) {
            self.highest = Some(severity);
        }
    }

    pub fn from_severities<I: IntoIterator<Item = Severity>>(severities: I) -> Self {
        let mut summary = SecuritySummary::default();
        for severity in severities {
            summary.absorb(severity);
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub hostname: String,
    pub ip: Option<String>,
    #[serde(default)]
    pub os: OsInfo,
    pub status: MachineStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub metrics: Option<MetricSnapshot>,
    /// Derived from security events; the store row keeps the default.
    #[serde(default)]
    pub security: SecuritySummary,
}

impl Machine {
    pub fn new(id: impl Into<MachineId>, hostname: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            ip: None,
            os: OsInfo::default(),
            status: MachineStatus::Offline,
            last_seen: None,
            created_at,
            metrics: None,
            security: SecuritySummary::default(),
        }
    }

    /// Canonical ordering key shared by the store and the cache.
    pub fn order_key(&self) -> (OffsetDateTime, &str) {
        (self.created_at, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub machine_id: MachineId,
    pub snapshot: MetricSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub group_type: GroupType,
    /// Serialized predicate, only meaningful for dynamic groups.
    pub query: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub machine_id: MachineId,
    pub position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub status: JobStatus,
    pub target: TargetSpec,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub machine_id: MachineId,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityEventStatus {
    Open,
    Ack,
    Resolved,
}

impl SecurityEventStatus {
    /// Open and acknowledged events still count towards the summary.
    pub fn is_active(&self) -> bool {
        matches!(self, SecurityEventStatus::Open | SecurityEventStatus::Ack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub machine_id: MachineId,
    pub category: String,
    pub path: Option<String>,
    pub severity: Severity,
    pub status: SecurityEventStatus,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub action: String,
    pub actor: Option<String>,
    pub machine_id: Option<MachineId>,
    pub event_type: String,
    pub severity: Severity,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
