//! Message kinds and typed payloads of the agent protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use time::OffsetDateTime;

use crate::jobs::ExecutionReport;
use crate::models::{ExecutionStatus, MachineId, MachineStatus, MetricSnapshot, OsInfo, Severity};

/// Closed set of inbound kinds. Adding a variant means adding a handler,
/// the router refuses to start otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Registration,
    Heartbeat,
    MetricReport,
    SecurityEvent,
    JobResult,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Registration,
        MessageKind::Heartbeat,
        MessageKind::MetricReport,
        MessageKind::SecurityEvent,
        MessageKind::JobResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Registration => "registration",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::MetricReport => "metric_report",
            MessageKind::SecurityEvent => "security_event",
            MessageKind::JobResult => "job_result",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        MessageKind::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind as read off the wire; unknown strings are kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireKind {
    Known(MessageKind),
    Unknown(String),
}

impl WireKind {
    pub fn from_wire(raw: &str) -> Self {
        match MessageKind::parse(raw) {
            Some(kind) => WireKind::Known(kind),
            None => WireKind::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WireKind::Known(kind) => kind.as_str(),
            WireKind::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub hostname: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub os: OsInfo,
    #[serde(default)]
    pub agent_version: Option<String>,
}

impl RegistrationPayload {
    pub fn check(&self) -> Result<(), String> {
        if self.hostname.trim().is_empty() {
            return Err("hostname must not be empty".into());
        }
        if let Some(ip) = &self.ip {
            ip.parse::<IpAddr>().map_err(|_| format!("invalid ip address '{ip}'"))?;
        }
        Ok(())
    }
}

fn default_online() -> MachineStatus {
    MachineStatus::Online
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default = "default_online")]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    #[default]
    Bytes,
    Kib,
    Mib,
    Percent,
}

/// A used/total pair in whatever unit the agent measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub used: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub unit: SizeUnit,
}

impl Usage {
    fn check(&self, name: &str) -> Result<(), String> {
        if !self.used.is_finite() || self.used < 0.0 {
            return Err(format!("{name}.used must be a non-negative number"));
        }
        match (self.unit, self.total) {
            (SizeUnit::Percent, _) if self.used > 100.0 => Err(format!("{name}.used exceeds 100 percent")),
            (SizeUnit::Percent, _) => Ok(()),
            (_, None) => Err(format!("{name}.total is required for unit {:?}", self.unit)),
            (_, Some(total)) if !total.is_finite() || total <= 0.0 => {
                Err(format!("{name}.total must be positive"))
            }
            (_, Some(total)) if self.used > total => Err(format!("{name}.used exceeds total")),
            _ => Ok(()),
        }
    }
}

/// Metrics as agents report them, before unit normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReportPayload {
    /// 0.0 - 1.0
    #[serde(default)]
    pub cpu_ratio: Option<f64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    pub memory: Usage,
    pub disk: Usage,
    #[serde(default)]
    pub uptime_ms: Option<u64>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}

impl MetricReportPayload {
    pub fn check(&self) -> Result<(), String> {
        match (self.cpu_percent, self.cpu_ratio) {
            (Some(p), _) if !(0.0..=100.0).contains(&p) => return Err("cpu_percent out of range".into()),
            (None, Some(r)) if !(0.0..=1.0).contains(&r) => return Err("cpu_ratio out of range".into()),
            (None, None) => return Err("cpu_percent or cpu_ratio is required".into()),
            _ => {}
        }
        self.memory.check("memory")?;
        self.disk.check("disk")?;
        if self.uptime_ms.is_none() && self.uptime_seconds.is_none() {
            return Err("uptime_ms or uptime_seconds is required".into());
        }
        Ok(())
    }
}

pub const FILE_INTEGRITY: &str = "file_integrity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEventPayload {
    pub category: String,
    #[serde(default)]
    pub path: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

impl SecurityEventPayload {
    pub fn check(&self) -> Result<(), String> {
        if self.category.trim().is_empty() {
            return Err("category must not be empty".into());
        }
        if self.category == FILE_INTEGRITY && self.path.as_deref().map_or(true, str::is_empty) {
            return Err("file integrity events need a path".into());
        }
        Ok(())
    }
}

pub fn check_report(report: &ExecutionReport) -> Result<(), String> {
    match report.status {
        ExecutionStatus::Running | ExecutionStatus::Completed | ExecutionStatus::Failed => Ok(()),
        other => Err(format!("status {other:?} cannot be reported")),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Registration(RegistrationPayload),
    Heartbeat(HeartbeatPayload),
    MetricReport(MetricReportPayload),
    SecurityEvent(SecurityEventPayload),
    JobResult(ExecutionReport),
    /// Envelope checked, body left untouched.
    Opaque(Value),
}

/// A message that passed every validator check.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub kind: WireKind,
    pub machine_id: MachineId,
    pub msg_id: String,
    pub sent_at: OffsetDateTime,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityFinding {
    pub category: String,
    pub path: Option<String>,
    pub severity: Severity,
    /// What the agent claimed before reclassification.
    pub reported_severity: Severity,
    pub description: String,
}

/// Canonical form handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Registration(RegistrationPayload),
    Heartbeat { status: MachineStatus },
    Metrics(MetricSnapshot),
    Security(SecurityFinding),
    JobResult(ExecutionReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub kind: MessageKind,
    pub machine_id: MachineId,
    pub msg_id: String,
    pub sent_at: OffsetDateTime,
    pub event: NormalizedEvent,
}
