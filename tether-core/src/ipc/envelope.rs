//! The message envelope, the only unit that crosses the process boundary.
//!
//! ## Wire shape
//!
//! ```json
//! { "channel": "add", "callId": "3:17", "kind": "request", "payload": {...} }
//! { "channel": "add", "callId": "3:17", "kind": "response", "payload": 5 }
//! { "channel": "add", "callId": "3:17", "kind": "response",
//!   "error": { "code": "SHAPE_MISMATCH", "message": "..." } }
//! { "channel": "tick", "kind": "event", "payload": { "n": 1 } }
//! ```
//!
//! | Kind | `callId` | Direction |
//! |------|----------|-----------|
//! | `request` | present | UI → controller (`invoke`) |
//! | `request` | absent | UI → controller (`send`) |
//! | `response` | present | controller → UI |
//! | `event` | absent | controller → UI |
//! | `subscribe` / `unsubscribe` | absent | UI → controller (listener interest) |
//!
//! Payloads are `serde_json::Value`, so they can never carry live references
//! or functions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies one attached UI context. Never reused within a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Correlation token linking a request to its response.
///
/// Allocated by the Bridge as `"<context>:<seq>"`; the sequence is
/// monotonically increasing so an id is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(context: ContextId, seq: u64) -> Self {
        Self(format!("{}:{}", context.0, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
    Subscribe,
    Unsubscribe,
}

/// Failure detail carried by a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    /// `invoke` request; `args` are the positional arguments as a JSON array.
    pub fn request(channel: impl Into<String>, call_id: CallId, args: Vec<Value>) -> Self {
        Self {
            channel: channel.into(),
            call_id: Some(call_id),
            kind: EnvelopeKind::Request,
            payload: Some(Value::Array(args)),
            error: None,
        }
    }

    /// Fire-and-forget `send`.
    pub fn message(channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            channel: channel.into(),
            call_id: None,
            kind: EnvelopeKind::Request,
            payload: Some(Value::Array(args)),
            error: None,
        }
    }

    pub fn success(channel: impl Into<String>, call_id: CallId, result: Value) -> Self {
        Self {
            channel: channel.into(),
            call_id: Some(call_id),
            kind: EnvelopeKind::Response,
            payload: Some(result),
            error: None,
        }
    }

    pub fn failure(channel: impl Into<String>, call_id: CallId, error: ErrorPayload) -> Self {
        Self {
            channel: channel.into(),
            call_id: Some(call_id),
            kind: EnvelopeKind::Response,
            payload: None,
            error: Some(error),
        }
    }

    pub fn event(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            call_id: None,
            kind: EnvelopeKind::Event,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::interest(channel, EnvelopeKind::Subscribe)
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::interest(channel, EnvelopeKind::Unsubscribe)
    }

    fn interest(channel: impl Into<String>, kind: EnvelopeKind) -> Self {
        Self {
            channel: channel.into(),
            call_id: None,
            kind,
            payload: None,
            error: None,
        }
    }

    /// Positional arguments of a request. A non-array payload is treated as a
    /// single argument; a missing payload as none.
    pub fn args(&self) -> Vec<Value> {
        match &self.payload {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_camel_case_call_id_and_lowercase_kind() {
        let env = Envelope::request("add", CallId::new(ContextId(3), 17), vec![json!(2), json!(3)]);
        let value = serde_json::to_value(&env).expect("serialize request");

        assert_eq!(value["channel"], "add");
        assert_eq!(value["callId"], "3:17");
        assert_eq!(value["kind"], "request");
        assert_eq!(value["payload"], json!([2, 3]));
        assert!(value.get("error").is_none(), "error should be omitted");
    }

    #[test]
    fn fire_and_forget_omits_call_id() {
        let env = Envelope::message("log-message", vec![json!("hello")]);
        let value = serde_json::to_value(&env).expect("serialize message");
        assert!(value.get("callId").is_none());
        assert_eq!(value["kind"], "request");
    }

    #[test]
    fn failure_response_carries_code_and_message_only() {
        let env = Envelope::failure(
            "add",
            CallId("1:1".into()),
            ErrorPayload {
                code: "SHAPE_MISMATCH".into(),
                message: "$.a: expected number, found string".into(),
            },
        );
        let value = serde_json::to_value(&env).expect("serialize failure");
        assert_eq!(value["kind"], "response");
        assert_eq!(value["error"]["code"], "SHAPE_MISMATCH");
        assert!(value.get("payload").is_none());

        let back: Envelope = serde_json::from_value(value).expect("deserialize failure");
        assert_eq!(back, env);
    }

    #[test]
    fn kind_rejects_unknown_values() {
        let raw = r#"{"channel":"x","kind":"Request"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn scalar_payload_is_a_single_argument() {
        let raw = r#"{"channel":"op","callId":"1:2","kind":"request","payload":true}"#;
        let env: Envelope = serde_json::from_str(raw).expect("deserialize request");
        assert_eq!(env.args(), vec![json!(true)]);
    }
}
