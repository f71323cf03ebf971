use regex::Regex;
use serde::{Deserialize, Serialize};

use super::messages::{
    MetricReportPayload, NormalizedEvent, NormalizedMessage, Payload, SecurityEventPayload, SecurityFinding,
    SizeUnit, Usage, ValidatedMessage, WireKind, FILE_INTEGRITY,
};
use crate::error::{KernelError, KernelResult};
use crate::models::{MetricSnapshot, Severity};

/// Path pattern to severity; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRule {
    pub pattern: String,
    pub severity: Severity,
}

impl PathRule {
    fn new(pattern: &str, severity: Severity) -> Self {
        Self { pattern: pattern.to_string(), severity }
    }
}

pub fn default_rules() -> Vec<PathRule> {
    vec![
        PathRule::new(r"^/etc/(passwd|shadow|sudoers|gshadow)$", Severity::Critical),
        PathRule::new(r"^/etc/ssh/", Severity::High),
        PathRule::new(r"^/(usr/)?s?bin/", Severity::High),
        PathRule::new(r"^/boot/", Severity::High),
        PathRule::new(r"^/etc/", Severity::Medium),
        PathRule::new(r"^/(tmp|var/tmp)/", Severity::Low),
    ]
}

pub struct Normalizer {
    rules: Vec<(Regex, Severity)>,
    fallback: Severity,
}

impl Default for Normalizer {
    fn default() -> Self {
        let rules = default_rules()
            .into_iter()
            .filter_map(|rule| Regex::new(&rule.pattern).ok().map(|re| (re, rule.severity)))
            .collect();
        Self { rules, fallback: Severity::Low }
    }
}

impl Normalizer {
    pub fn new(rules: &[PathRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| Ok((Regex::new(&rule.pattern)?, rule.severity)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules, fallback: Severity::Low })
    }

    pub fn classify_path(&self, path: &str) -> Severity {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(path))
            .map(|(_, severity)| *severity)
            .unwrap_or(self.fallback)
    }

    pub fn normalize(&self, message: ValidatedMessage) -> KernelResult<NormalizedMessage> {
        let kind = match &message.kind {
            WireKind::Known(kind) => *kind,
            WireKind::Unknown(raw) => return Err(KernelError::UnknownMessageKind(raw.clone())),
        };
        let event = match message.payload {
            Payload::Registration(payload) => NormalizedEvent::Registration(payload),
            Payload::Heartbeat(payload) => NormalizedEvent::Heartbeat { status: payload.status },
            Payload::MetricReport(payload) => NormalizedEvent::Metrics(metrics(&payload, message.sent_at)),
            Payload::SecurityEvent(payload) => NormalizedEvent::Security(self.finding(payload)),
            Payload::JobResult(report) => NormalizedEvent::JobResult(report),
            Payload::Opaque(_) => return Err(KernelError::UnknownMessageKind(kind.to_string())),
        };
        Ok(NormalizedMessage {
            kind,
            machine_id: message.machine_id,
            msg_id: message.msg_id,
            sent_at: message.sent_at,
            event,
        })
    }

    fn finding(&self, payload: SecurityEventPayload) -> SecurityFinding {
        let severity = match (&payload.category[..], payload.path.as_deref()) {
            (FILE_INTEGRITY, Some(path)) => self.classify_path(path),
            _ => payload.severity,
        };
        SecurityFinding {
            category: payload.category,
            path: payload.path,
            severity,
            reported_severity: payload.severity,
            description: payload.description,
        }
    }
}

fn metrics(payload: &MetricReportPayload, sent_at: time::OffsetDateTime) -> MetricSnapshot {
    let cpu = payload
        .cpu_percent
        .or_else(|| payload.cpu_ratio.map(|ratio| ratio * 100.0))
        .unwrap_or_default();
    let uptime = payload
        .uptime_seconds
        .or_else(|| payload.uptime_ms.map(|ms| ms / 1_000))
        .unwrap_or_default();
    MetricSnapshot {
        cpu_percent: round2(cpu),
        ram_percent: round2(percent_of(&payload.memory)),
        disk_percent: round2(percent_of(&payload.disk)),
        uptime_seconds: uptime,
        collected_at: sent_at,
    }
}

fn percent_of(usage: &Usage) -> f64 {
    match (usage.unit, usage.total) {
        (SizeUnit::Percent, _) => usage.used,
        // used and total share a unit, so the ratio is unit-free
        (_, Some(total)) if total > 0.0 => usage.used / total * 100.0,
        _ => 0.0,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::MessageKind;
    use time::OffsetDateTime;

    fn validated(payload: Payload, kind: MessageKind) -> ValidatedMessage {
        ValidatedMessage {
            kind: WireKind::Known(kind),
            machine_id: "m1".into(),
            msg_id: "1".into(),
            sent_at: OffsetDateTime::UNIX_EPOCH,
            payload,
        }
    }

    #[test]
    fn default_path_rules() {
        let normalizer = Normalizer::default();
        assert_eq!(normalizer.classify_path("/etc/shadow"), Severity::Critical);
        assert_eq!(normalizer.classify_path("/etc/shadow-"), Severity::Medium);
        assert_eq!(normalizer.classify_path("/etc/ssh/sshd_config"), Severity::High);
        assert_eq!(normalizer.classify_path("/usr/sbin/sshd"), Severity::High);
        assert_eq!(normalizer.classify_path("/bin/ls"), Severity::High);
        assert_eq!(normalizer.classify_path("/boot/vmlinuz"), Severity::High);
        assert_eq!(normalizer.classify_path("/etc/hosts"), Severity::Medium);
        assert_eq!(normalizer.classify_path("/var/tmp/x"), Severity::Low);
        assert_eq!(normalizer.classify_path("/home/alice/.bashrc"), Severity::Low);
    }

    #[test]
    fn file_integrity_severity_is_not_trusted() {
        let normalizer = Normalizer::default();
        let payload = SecurityEventPayload {
            category: FILE_INTEGRITY.into(),
            path: Some("/etc/sudoers".into()),
            severity: Severity::Info,
            description: "modified".into(),
        };
        let message = normalizer.normalize(validated(Payload::SecurityEvent(payload), MessageKind::SecurityEvent)).unwrap();
        match message.event {
            NormalizedEvent::Security(finding) => {
                assert_eq!(finding.severity, Severity::Critical);
                assert_eq!(finding.reported_severity, Severity::Info);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_categories_keep_their_severity() {
        let normalizer = Normalizer::default();
        let payload = SecurityEventPayload {
            category: "process".into(),
            path: Some("/etc/shadow".into()),
            severity: Severity::Medium,
            description: String::new(),
        };
        let message = normalizer.normalize(validated(Payload::SecurityEvent(payload), MessageKind::SecurityEvent)).unwrap();
        assert!(matches!(message.event, NormalizedEvent::Security(SecurityFinding { severity: Severity::Medium, .. })));
    }

    #[test]
    fn metrics_are_converted_to_percent_and_seconds() {
        let payload = MetricReportPayload {
            cpu_ratio: Some(0.256),
            cpu_percent: None,
            memory: Usage { used: 3.0 * 1024.0 * 1024.0, total: Some(4.0 * 1024.0 * 1024.0), unit: SizeUnit::Kib },
            disk: Usage { used: 12.5, total: None, unit: SizeUnit::Percent },
            uptime_ms: Some(90_500),
            uptime_seconds: None,
        };
        let message = Normalizer::default()
            .normalize(validated(Payload::MetricReport(payload), MessageKind::MetricReport))
            .unwrap();
        match message.event {
            NormalizedEvent::Metrics(snapshot) => {
                assert_eq!(snapshot.cpu_percent, 25.6);
                assert_eq!(snapshot.ram_percent, 75.0);
                assert_eq!(snapshot.disk_percent, 12.5);
                assert_eq!(snapshot.uptime_seconds, 90);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn custom_rules_must_compile() {
        assert!(Normalizer::new(&[PathRule::new("^/(", Severity::High)]).is_err());
        let custom = Normalizer::new(&[PathRule::new("^/srv/", Severity::High)]).unwrap();
        assert_eq!(custom.classify_path("/srv/app"), Severity::High);
        assert_eq!(custom.classify_path("/etc/shadow"), Severity::Low);
    }
}
