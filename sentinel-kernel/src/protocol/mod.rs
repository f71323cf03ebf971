/*!
Inbound agent protocol: parse → validate → route → normalize → handle.

Every message is processed in isolation. Whatever goes wrong with one
message (garbage bytes, a bad signature, a failing handler) is counted,
logged, audited when security relevant, and the connection carries on.
*/

pub mod handlers;
pub mod messages;
pub mod normalizer;
pub mod parser;
pub mod router;
pub mod validator;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::models::{MachineId, Severity};
use messages::MessageKind;
use normalizer::Normalizer;
use router::Router;
use validator::{Validation, ValidationFailure, Validator};

/// Who is on the other end of the connection, as established by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub machine_id: MachineId,
}

impl ConnectionContext {
    pub fn new(machine_id: impl Into<MachineId>) -> Self {
        Self { machine_id: machine_id.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Handled(MessageKind),
    Malformed(String),
    Rejected(ValidationFailure),
    UnknownKind(String),
    HandlerFailed { kind: MessageKind, error: String },
}

impl PipelineOutcome {
    /// The envelope checked out, whatever became of the message afterwards.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, PipelineOutcome::Malformed(_) | PipelineOutcome::Rejected(_))
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    unknown: AtomicU64,
    handled: AtomicU64,
    handler_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub processed: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub unknown: u64,
    pub handled: u64,
    pub handler_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            processed: self.processed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Pipeline {
    validator: Validator,
    router: Router,
    normalizer: Normalizer,
    audit: AuditSink,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(validator: Validator, router: Router, normalizer: Normalizer, audit: AuditSink) -> Self {
        Self { validator, router, normalizer, audit, stats: PipelineStats::default() }
    }

    pub fn stats(&self) -> PipelineCounters {
        self.stats.snapshot()
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub async fn process(&self, ctx: &ConnectionContext, raw: &[u8]) -> PipelineOutcome {
        PipelineStats::bump(&self.stats.processed);

        let frame = match parser::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                PipelineStats::bump(&self.stats.malformed);
                warn!(machine_id = %ctx.machine_id, error = %e, "malformed message dropped");
                return PipelineOutcome::Malformed(e.to_string());
            }
        };
        let msg_id = frame.msg_id.clone();
        let wire_kind = frame.kind.as_str().to_string();

        let message = match self.validator.validate(ctx, frame) {
            Validation::Valid(message) => message,
            Validation::Invalid(failure) => {
                PipelineStats::bump(&self.stats.rejected);
                warn!(machine_id = %ctx.machine_id, kind = %wire_kind, msg_id = %msg_id, reason = %failure.reason, "message rejected");
                if failure.kind.is_security_relevant() {
                    self.audit.record(
                        AuditRecord::new("protocol.reject", "security", Severity::High)
                            .machine(ctx.machine_id.clone())
                            .details(json!({
                                "failure": failure.kind,
                                "reason": failure.reason,
                                "kind": wire_kind,
                                "msg_id": msg_id,
                            })),
                    );
                }
                return PipelineOutcome::Rejected(failure);
            }
        };

        let (kind, handler) = match self.router.route(&message.kind) {
            Ok(route) => route,
            Err(e) => {
                PipelineStats::bump(&self.stats.unknown);
                warn!(machine_id = %ctx.machine_id, kind = %wire_kind, "{e}");
                return PipelineOutcome::UnknownKind(wire_kind);
            }
        };

        let normalized = match self.normalizer.normalize(message) {
            Ok(normalized) => normalized,
            Err(e) => {
                PipelineStats::bump(&self.stats.unknown);
                return PipelineOutcome::UnknownKind(e.to_string());
            }
        };

        match handler.handle(ctx, normalized).await {
            Ok(()) => {
                PipelineStats::bump(&self.stats.handled);
                debug!(machine_id = %ctx.machine_id, %kind, msg_id = %msg_id, "message handled");
                PipelineOutcome::Handled(kind)
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.handler_failures);
                warn!(machine_id = %ctx.machine_id, %kind, msg_id = %msg_id, error = %e, "handler failed");
                PipelineOutcome::HandlerFailed { kind, error: e.to_string() }
            }
        }
    }
}
