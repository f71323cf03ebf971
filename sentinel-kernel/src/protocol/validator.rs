//! Envelope and payload checks.
//!
//! Order matters: identity, signature, freshness, replay, then the typed
//! payload. A nonce is only remembered once the signature is known good, so
//! forged traffic cannot fill the replay window.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use time::{Duration, OffsetDateTime};

use super::messages::{
    check_report, HeartbeatPayload, MessageKind, MetricReportPayload, Payload, RegistrationPayload,
    SecurityEventPayload, ValidatedMessage, WireKind,
};
use super::parser::Frame;
use super::ConnectionContext;
use crate::jobs::ExecutionReport;
use crate::models::MachineId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    IdentityMismatch,
    BadSignature,
    Stale,
    Replay,
    Schema,
    OutOfRange,
}

impl FailureKind {
    /// Failures that hint at tampering rather than a buggy agent.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            FailureKind::IdentityMismatch | FailureKind::BadSignature | FailureKind::Stale | FailureKind::Replay
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl ValidationFailure {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }
}

#[derive(Debug)]
pub enum Validation {
    Valid(ValidatedMessage),
    Invalid(ValidationFailure),
}

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub secret: Vec<u8>,
    pub clock_skew: Duration,
    pub replay_window: Duration,
    /// Nonces remembered per machine.
    pub replay_capacity: usize,
}

impl ValidatorSettings {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            clock_skew: Duration::seconds(300),
            replay_window: Duration::seconds(600),
            replay_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    Fresh,
    Seen,
    /// Every slot holds a nonce that is still inside the window.
    Full,
}

/// Bounded per-machine nonce memory. Nonces are only forgotten once they
/// leave the window; a machine that fills its slots faster is refused.
pub struct ReplayGuard {
    window: Duration,
    capacity: usize,
    seen: Mutex<HashMap<MachineId, VecDeque<(String, OffsetDateTime)>>>,
}

impl ReplayGuard {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self { window, capacity: capacity.max(1), seen: Mutex::new(HashMap::new()) }
    }

    /// Records the nonce when it is fresh.
    pub fn check_and_record(&self, machine_id: &str, nonce: &str, now: OffsetDateTime) -> NonceCheck {
        let mut seen = self.seen.lock();
        let nonces = seen.entry(machine_id.to_string()).or_default();
        let horizon = now - self.window;
        while nonces.front().is_some_and(|(_, at)| *at < horizon) {
            nonces.pop_front();
        }
        if nonces.iter().any(|(known, _)| known == nonce) {
            return NonceCheck::Seen;
        }
        if nonces.len() >= self.capacity {
            return NonceCheck::Full;
        }
        nonces.push_back((nonce.to_string(), now));
        NonceCheck::Fresh
    }

    pub fn forget(&self, machine_id: &str) {
        self.seen.lock().remove(machine_id);
    }
}

pub struct Validator {
    secret: Vec<u8>,
    clock_skew: Duration,
    replay: ReplayGuard,
}

impl Validator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            // a message dated `skew` ahead stays fresh for `2 * skew`
            replay: ReplayGuard::new(settings.replay_window.max(settings.clock_skew * 2), settings.replay_capacity),
            secret: settings.secret,
            clock_skew: settings.clock_skew,
        }
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn validate(&self, ctx: &ConnectionContext, frame: Frame) -> Validation {
        self.validate_at(ctx, frame, OffsetDateTime::now_utc())
    }

    pub fn validate_at(&self, ctx: &ConnectionContext, frame: Frame, now: OffsetDateTime) -> Validation {
        match self.check(ctx, frame, now) {
            Ok(message) => Validation::Valid(message),
            Err(failure) => Validation::Invalid(failure),
        }
    }

    fn check(&self, ctx: &ConnectionContext, frame: Frame, now: OffsetDateTime) -> Result<ValidatedMessage, ValidationFailure> {
        if frame.machine_id != ctx.machine_id {
            return Err(ValidationFailure::new(
                FailureKind::IdentityMismatch,
                format!("envelope claims '{}' on the connection of '{}'", frame.machine_id, ctx.machine_id),
            ));
        }

        self.verify_signature(&frame)?;

        let sent_at = OffsetDateTime::from_unix_timestamp(frame.ts)
            .map_err(|_| ValidationFailure::new(FailureKind::Stale, format!("timestamp {} out of range", frame.ts)))?;
        if (now - sent_at).abs() > self.clock_skew {
            return Err(ValidationFailure::new(
                FailureKind::Stale,
                format!("timestamp {} outside the {}s skew window", frame.ts, self.clock_skew.whole_seconds()),
            ));
        }

        match self.replay.check_and_record(&frame.machine_id, &frame.nonce, now) {
            NonceCheck::Fresh => {}
            NonceCheck::Seen => {
                return Err(ValidationFailure::new(FailureKind::Replay, format!("nonce '{}' already used", frame.nonce)));
            }
            NonceCheck::Full => {
                return Err(ValidationFailure::new(FailureKind::Replay, "too many messages inside the replay window"));
            }
        }

        let payload = match &frame.kind {
            WireKind::Known(kind) => decode_payload(*kind, frame.payload)?,
            WireKind::Unknown(_) => Payload::Opaque(frame.payload),
        };

        Ok(ValidatedMessage {
            kind: frame.kind,
            machine_id: frame.machine_id,
            msg_id: frame.msg_id,
            sent_at,
            payload,
        })
    }

    fn verify_signature(&self, frame: &Frame) -> Result<(), ValidationFailure> {
        let bad = |reason: &str| ValidationFailure::new(FailureKind::BadSignature, reason);
        let provided = general_purpose::STANDARD
            .decode(frame.signature.as_bytes())
            .map_err(|_| bad("signature is not base64"))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| bad("signing key rejected"))?;
        mac.update(frame.canonical_body().as_bytes());
        mac.verify_slice(&provided).map_err(|_| bad("signature mismatch"))
    }
}

/// Signs a canonical body the way agents do.
pub fn sign(secret: &[u8], body: &str) -> String {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body.as_bytes());
            general_purpose::STANDARD.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

fn decode_payload(kind: MessageKind, raw: Value) -> Result<Payload, ValidationFailure> {
    let range = |reason: String| ValidationFailure::new(FailureKind::OutOfRange, reason);
    let payload = match kind {
        MessageKind::Registration => {
            let payload: RegistrationPayload = decode(kind, raw)?;
            payload.check().map_err(range)?;
            Payload::Registration(payload)
        }
        MessageKind::Heartbeat => Payload::Heartbeat(decode::<HeartbeatPayload>(kind, raw)?),
        MessageKind::MetricReport => {
            let payload: MetricReportPayload = decode(kind, raw)?;
            payload.check().map_err(range)?;
            Payload::MetricReport(payload)
        }
        MessageKind::SecurityEvent => {
            let payload: SecurityEventPayload = decode(kind, raw)?;
            payload.check().map_err(range)?;
            Payload::SecurityEvent(payload)
        }
        MessageKind::JobResult => {
            let report: ExecutionReport = decode(kind, raw)?;
            check_report(&report).map_err(range)?;
            Payload::JobResult(report)
        }
    };
    Ok(payload)
}

fn decode<T: DeserializeOwned>(kind: MessageKind, raw: Value) -> Result<T, ValidationFailure> {
    // a heartbeat may come with no body at all
    let raw = if raw.is_null() { Value::Object(Default::default()) } else { raw };
    serde_json::from_value(raw)
        .map_err(|e| ValidationFailure::new(FailureKind::Schema, format!("{kind} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MachineStatus;
    use crate::protocol::parser::canonical_body;
    use serde_json::json;

    const SECRET: &[u8] = b"fleet-secret";

    fn frame(kind: &str, machine_id: &str, nonce: &str, ts: i64, payload: Value) -> Frame {
        let body = canonical_body(kind, machine_id, "msg-1", ts, nonce, &payload);
        Frame {
            kind: WireKind::from_wire(kind),
            machine_id: machine_id.into(),
            msg_id: "msg-1".into(),
            ts,
            nonce: nonce.into(),
            signature: sign(SECRET, &body),
            payload,
        }
    }

    fn ctx() -> ConnectionContext {
        ConnectionContext::new("m1")
    }

    fn validator() -> Validator {
        Validator::new(ValidatorSettings::new(SECRET))
    }

    fn failure(validation: Validation) -> ValidationFailure {
        match validation {
            Validation::Invalid(failure) => failure,
            Validation::Valid(message) => panic!("expected a failure, got {message:?}"),
        }
    }

    #[test]
    fn accepts_a_signed_fresh_heartbeat() {
        let now = OffsetDateTime::now_utc();
        let frame = frame("heartbeat", "m1", "n1", now.unix_timestamp(), json!({"status": "degraded"}));
        match validator().validate_at(&ctx(), frame, now) {
            Validation::Valid(message) => {
                assert_eq!(message.payload, Payload::Heartbeat(HeartbeatPayload { status: MachineStatus::Degraded }));
            }
            Validation::Invalid(failure) => panic!("unexpected {failure:?}"),
        }
    }

    #[test]
    fn rejects_foreign_identity() {
        let now = OffsetDateTime::now_utc();
        let frame = frame("heartbeat", "m2", "n1", now.unix_timestamp(), Value::Null);
        assert_eq!(failure(validator().validate_at(&ctx(), frame, now)).kind, FailureKind::IdentityMismatch);
    }

    #[test]
    fn rejects_tampered_payload() {
        let now = OffsetDateTime::now_utc();
        let mut frame = frame("heartbeat", "m1", "n1", now.unix_timestamp(), json!({"status": "online"}));
        frame.payload = json!({"status": "degraded"});
        assert_eq!(failure(validator().validate_at(&ctx(), frame, now)).kind, FailureKind::BadSignature);
    }

    #[test]
    fn rejects_stale_messages() {
        let now = OffsetDateTime::now_utc();
        let frame = frame("heartbeat", "m1", "n1", now.unix_timestamp() - 3_600, Value::Null);
        assert_eq!(failure(validator().validate_at(&ctx(), frame, now)).kind, FailureKind::Stale);
    }

    #[test]
    fn rejects_replayed_nonce() {
        let now = OffsetDateTime::now_utc();
        let validator = validator();
        let first = frame("heartbeat", "m1", "n1", now.unix_timestamp(), Value::Null);
        assert!(matches!(validator.validate_at(&ctx(), first.clone(), now), Validation::Valid(_)));
        let replay = failure(validator.validate_at(&ctx(), first, now));
        assert_eq!(replay.kind, FailureKind::Replay);
        assert!(replay.kind.is_security_relevant());
    }

    #[test]
    fn forged_messages_do_not_burn_nonces() {
        let now = OffsetDateTime::now_utc();
        let validator = validator();
        let mut forged = frame("heartbeat", "m1", "n1", now.unix_timestamp(), Value::Null);
        forged.signature = sign(b"wrong", "anything");
        assert_eq!(failure(validator.validate_at(&ctx(), forged, now)).kind, FailureKind::BadSignature);
        let genuine = frame("heartbeat", "m1", "n1", now.unix_timestamp(), Value::Null);
        assert!(matches!(validator.validate_at(&ctx(), genuine, now), Validation::Valid(_)));
    }

    #[test]
    fn schema_and_range_failures_are_not_security_relevant() {
        let now = OffsetDateTime::now_utc();
        let validator = validator();
        let missing = frame("security_event", "m1", "n1", now.unix_timestamp(), json!({"category": "process"}));
        let schema = failure(validator.validate_at(&ctx(), missing, now));
        assert_eq!(schema.kind, FailureKind::Schema);
        assert!(!schema.kind.is_security_relevant());

        let wild = frame(
            "metric_report",
            "m1",
            "n2",
            now.unix_timestamp(),
            json!({"cpu_percent": 180.0, "memory": {"used": 1, "total": 2}, "disk": {"used": 1, "total": 2}, "uptime_seconds": 5}),
        );
        assert_eq!(failure(validator.validate_at(&ctx(), wild, now)).kind, FailureKind::OutOfRange);
    }

    #[test]
    fn unknown_kinds_keep_an_opaque_payload() {
        let now = OffsetDateTime::now_utc();
        let frame = frame("firmware", "m1", "n1", now.unix_timestamp(), json!({"v": 2}));
        match validator().validate_at(&ctx(), frame, now) {
            Validation::Valid(message) => assert_eq!(message.payload, Payload::Opaque(json!({"v": 2}))),
            Validation::Invalid(failure) => panic!("unexpected {failure:?}"),
        }
    }

    #[test]
    fn replay_guard_refuses_when_full() {
        let guard = ReplayGuard::new(Duration::minutes(10), 2);
        let now = OffsetDateTime::now_utc();
        assert_eq!(guard.check_and_record("m1", "a", now), NonceCheck::Fresh);
        assert_eq!(guard.check_and_record("m1", "b", now), NonceCheck::Fresh);
        assert_eq!(guard.check_and_record("m1", "c", now), NonceCheck::Full);
        // nothing fresh was forgotten to make room
        assert_eq!(guard.check_and_record("m1", "a", now), NonceCheck::Seen);
        assert_eq!(guard.check_and_record("m2", "c", now), NonceCheck::Fresh);
        // slots free up once the window has passed
        let later = now + Duration::minutes(11);
        assert_eq!(guard.check_and_record("m1", "c", later), NonceCheck::Fresh);
    }

    #[test]
    fn future_dated_messages_cannot_be_replayed_while_fresh() {
        let now = OffsetDateTime::now_utc();
        let mut settings = ValidatorSettings::new(SECRET);
        settings.clock_skew = Duration::seconds(300);
        settings.replay_window = Duration::seconds(300);
        let validator = Validator::new(settings);
        let ahead = frame("heartbeat", "m1", "n1", (now + Duration::seconds(300)).unix_timestamp(), Value::Null);
        assert!(matches!(validator.validate_at(&ctx(), ahead.clone(), now), Validation::Valid(_)));
        let replay = failure(validator.validate_at(&ctx(), ahead, now + Duration::seconds(550)));
        assert_eq!(replay.kind, FailureKind::Replay);
    }
}
