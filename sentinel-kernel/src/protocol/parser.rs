use serde::Deserialize;
use serde_json::Value;

use super::messages::WireKind;
use crate::error::KernelError;
use crate::models::MachineId;

pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Envelope of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: WireKind,
    pub machine_id: MachineId,
    pub msg_id: String,
    /// Unix seconds as sent by the agent.
    pub ts: i64,
    pub nonce: String,
    /// base64 HMAC-SHA256 over [`Frame::canonical_body`].
    pub signature: String,
    pub payload: Value,
}

#[derive(Deserialize)]
struct RawFrame {
    kind: String,
    machine_id: String,
    msg_id: String,
    ts: i64,
    nonce: String,
    signature: String,
    #[serde(default)]
    payload: Value,
}

impl Frame {
    /// `kind|machine_id|msg_id|ts|nonce|payload-json`, payload in compact form.
    pub fn canonical_body(&self) -> String {
        canonical_body(self.kind.as_str(), &self.machine_id, &self.msg_id, self.ts, &self.nonce, &self.payload)
    }
}

pub fn canonical_body(kind: &str, machine_id: &str, msg_id: &str, ts: i64, nonce: &str, payload: &Value) -> String {
    let payload = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("{kind}|{machine_id}|{msg_id}|{ts}|{nonce}|{payload}")
}

/// Bytes to frame. Never panics; every failure is a [`KernelError::MalformedMessage`].
pub fn parse(raw: &[u8]) -> Result<Frame, KernelError> {
    if raw.len() > MAX_MESSAGE_BYTES {
        return Err(malformed(format!("message of {} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit", raw.len())));
    }
    let text = std::str::from_utf8(raw).map_err(|e| malformed(format!("not utf-8: {e}")))?;
    let frame: RawFrame = serde_json::from_str(text).map_err(|e| malformed(format!("bad envelope: {e}")))?;

    for (name, value) in [
        ("kind", &frame.kind),
        ("machine_id", &frame.machine_id),
        ("msg_id", &frame.msg_id),
        ("nonce", &frame.nonce),
        ("signature", &frame.signature),
    ] {
        if value.trim().is_empty() {
            return Err(malformed(format!("{name} must not be empty")));
        }
    }
    if !matches!(frame.payload, Value::Object(_) | Value::Null) {
        return Err(malformed("payload must be an object".to_string()));
    }

    Ok(Frame {
        kind: WireKind::from_wire(&frame.kind),
        machine_id: frame.machine_id,
        msg_id: frame.msg_id,
        ts: frame.ts,
        nonce: frame.nonce,
        signature: frame.signature,
        payload: frame.payload,
    })
}

fn malformed(reason: String) -> KernelError {
    KernelError::MalformedMessage(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::MessageKind;
    use serde_json::json;

    fn envelope(kind: &str) -> Value {
        json!({
            "kind": kind,
            "machine_id": "m1",
            "msg_id": "1",
            "ts": 1_700_000_000,
            "nonce": "n1",
            "signature": "c2ln",
            "payload": {"status": "online"}
        })
    }

    #[test]
    fn parses_known_and_unknown_kinds() {
        let frame = parse(envelope("heartbeat").to_string().as_bytes()).unwrap();
        assert_eq!(frame.kind, WireKind::Known(MessageKind::Heartbeat));
        let frame = parse(envelope("firmware").to_string().as_bytes()).unwrap();
        assert_eq!(frame.kind, WireKind::Unknown("firmware".into()));
    }

    #[test]
    fn garbage_is_malformed() {
        for raw in [&b"\xff\xfe\x00"[..], b"not json", b"[]", b"{\"kind\":\"heartbeat\"}"] {
            assert!(matches!(parse(raw), Err(KernelError::MalformedMessage(_))));
        }
    }

    #[test]
    fn oversized_is_malformed() {
        let raw = vec![b' '; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(parse(&raw), Err(KernelError::MalformedMessage(_))));
    }

    #[test]
    fn empty_fields_and_scalar_payloads_are_malformed() {
        let mut value = envelope("heartbeat");
        value["nonce"] = json!("");
        assert!(parse(value.to_string().as_bytes()).is_err());
        let mut value = envelope("heartbeat");
        value["payload"] = json!(42);
        assert!(parse(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn canonical_body_layout() {
        let frame = parse(envelope("heartbeat").to_string().as_bytes()).unwrap();
        assert_eq!(frame.canonical_body(), r#"heartbeat|m1|1|1700000000|n1|{"status":"online"}"#);
    }
}
