/*!
Agent-side message construction.

[`AgentStub`] produces the exact bytes a well-behaved agent would put on
`<prefix>/agents/<id>/up`. [`MessageBuilder`] exposes every envelope field so
tests can break one thing at a time: a stale timestamp, a reused nonce, a
spoofed machine id, a wrong key.
*/

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

use sentinel_kernel::models::{ExecutionStatus, MachineStatus, Severity};
use sentinel_kernel::protocol::parser::canonical_body;
use sentinel_kernel::protocol::validator::sign;

pub struct AgentStub {
    machine_id: String,
    secret: Vec<u8>,
    seq: AtomicU64,
}

impl AgentStub {
    pub fn new(machine_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self { machine_id: machine_id.into(), secret: secret.into(), seq: AtomicU64::new(0) }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Fresh msg id and nonce, current time, signed with the agent's key.
    pub fn message(&self, kind: &str, payload: Value) -> MessageBuilder {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        MessageBuilder {
            kind: kind.to_string(),
            machine_id: self.machine_id.clone(),
            msg_id: format!("{}-{seq}", self.machine_id),
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            nonce: uuid::Uuid::new_v4().to_string(),
            payload,
            secret: self.secret.clone(),
        }
    }

    pub fn registration(&self, ip: &str) -> Vec<u8> {
        self.message(
            "registration",
            json!({
                "hostname": format!("{}.lan", self.machine_id),
                "ip": ip,
                "os": { "family": "linux", "version": "6.8", "arch": "x86_64" },
                "agent_version": "0.1.0",
            }),
        )
        .build()
    }

    pub fn heartbeat(&self, status: MachineStatus) -> Vec<u8> {
        self.message("heartbeat", json!({ "status": status })).build()
    }

    pub fn metrics(&self, cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Vec<u8> {
        self.message(
            "metric_report",
            json!({
                "cpu_percent": cpu_percent,
                "memory": { "used": memory_percent, "unit": "percent" },
                "disk": { "used": disk_percent, "unit": "percent" },
                "uptime_seconds": 3600,
            }),
        )
        .build()
    }

    pub fn security_event(&self, category: &str, path: Option<&str>, severity: Severity) -> Vec<u8> {
        self.message(
            "security_event",
            json!({
                "category": category,
                "path": path,
                "severity": severity,
                "description": format!("{category} reported by {}", self.machine_id),
            }),
        )
        .build()
    }

    pub fn job_result(&self, job_id: &str, execution_id: &str, status: ExecutionStatus, exit_code: i32) -> Vec<u8> {
        self.message(
            "job_result",
            json!({
                "job_id": job_id,
                "execution_id": execution_id,
                "status": status,
                "output": "ok\n",
                "exit_code": exit_code,
            }),
        )
        .build()
    }
}

/// One envelope, signed when built.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    pub kind: String,
    pub machine_id: String,
    pub msg_id: String,
    pub ts: i64,
    pub nonce: String,
    pub payload: Value,
    secret: Vec<u8>,
}

impl MessageBuilder {
    pub fn ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = nonce.into();
        self
    }

    /// Claims another identity; the signature still covers the claimed id.
    pub fn machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    pub fn secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn to_json(&self) -> Value {
        let body = canonical_body(&self.kind, &self.machine_id, &self.msg_id, self.ts, &self.nonce, &self.payload);
        json!({
            "kind": self.kind,
            "machine_id": self.machine_id,
            "msg_id": self.msg_id,
            "ts": self.ts,
            "nonce": self.nonce,
            "signature": sign(&self.secret, &body),
            "payload": self.payload,
        })
    }

    pub fn build(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_kernel::protocol::parser;

    #[test]
    fn built_messages_parse_and_carry_a_matching_signature() {
        let agent = AgentStub::new("m1", "k");
        let raw = agent.metrics(12.5, 40.0, 70.25);
        let frame = parser::parse(&raw).unwrap();
        assert_eq!(frame.machine_id, "m1");
        assert_eq!(frame.msg_id, "m1-0");
        assert_eq!(frame.signature, sign(b"k", &frame.canonical_body()));
    }

    #[test]
    fn each_message_gets_a_fresh_nonce() {
        let agent = AgentStub::new("m1", "k");
        let a = agent.message("heartbeat", json!({}));
        let b = agent.message("heartbeat", json!({}));
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.msg_id, b.msg_id);
    }
}
