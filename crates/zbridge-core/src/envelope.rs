//! Wire envelope for the bridge protocol.
//!
//! Every frame is a JSON object carrying an `event` tag (`action` is a
//! deprecated synonym kept for older clients), an opaque correlation token
//! under `requestId` or `_requestId`, and event-specific fields. Responses
//! echo the correlation token verbatim under the same key it arrived with;
//! spontaneous broadcasts carry none.

use serde_json::{Map, Value};

/// Correlation token extracted from an inbound frame. `key` records which
/// wire field carried it so the reply can echo it under the same field.
#[derive(Clone, Debug, PartialEq)]
pub struct Correlation {
    pub key: String,
    pub value: Value,
}

/// A parsed inbound frame.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub event: Option<String>,
    /// Deprecated synonym for `event`. `event` takes precedence.
    pub action: Option<String>,
    payload: Map<String, Value>,
}

impl Envelope {
    /// Parse a raw text frame. Returns `None` when the frame is not a JSON
    /// object; the caller treats such frames as opaque broadcast payloads.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?.clone();
        Some(Self::from_object(obj))
    }

    pub fn from_object(payload: Map<String, Value>) -> Self {
        let event = payload.get("event").and_then(|v| v.as_str()).map(String::from);
        let action = payload.get("action").and_then(|v| v.as_str()).map(String::from);
        Self { event, action, payload }
    }

    /// The effective event tag: `event` if present, else the deprecated
    /// `action` alias.
    pub fn resolved_event(&self) -> Option<&str> {
        self.event.as_deref().or(self.action.as_deref())
    }

    /// Correlation token, preferring `requestId` over `_requestId`.
    pub fn correlation(&self) -> Option<Correlation> {
        for key in ["requestId", "_requestId"] {
            if let Some(value) = self.payload.get(key) {
                if !value.is_null() {
                    return Some(Correlation {
                        key: key.to_string(),
                        value: value.clone(),
                    });
                }
            }
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Required string field; the error message feeds a validation envelope.
    pub fn require_str(&self, key: &str) -> Result<&str, String> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing required parameter: {key}"))
    }

    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn optional_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(|v| v.as_i64())
    }

    pub fn optional_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(|v| v.as_bool())
    }
}

/// Attach a correlation token to an outbound object, echoing it under the
/// field it arrived with.
pub fn echo(mut body: Value, corr: Option<&Correlation>) -> Value {
    if let (Some(corr), Some(obj)) = (corr, body.as_object_mut()) {
        obj.insert(corr.key.clone(), corr.value.clone());
    }
    body
}

/// Build a `{"result": ...}` reply with the correlation token echoed.
pub fn ok_reply(result: Value, corr: Option<&Correlation>) -> Value {
    echo(serde_json::json!({ "result": result }), corr)
}

/// Build an `{"error": ...}` reply with the correlation token echoed.
pub fn error_reply(message: impl Into<String>, corr: Option<&Correlation>) -> Value {
    echo(serde_json::json!({ "error": message.into() }), corr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_envelope() {
        let env = Envelope::parse(r#"{"event":"cache_stats","requestId":7}"#).unwrap();
        assert_eq!(env.resolved_event(), Some("cache_stats"));
        let corr = env.correlation().unwrap();
        assert_eq!(corr.key, "requestId");
        assert_eq!(corr.value, serde_json::json!(7));
    }

    #[test]
    fn parse_rejects_non_object() {
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse(r#"[1,2,3]"#).is_none());
        assert!(Envelope::parse(r#""just a string""#).is_none());
    }

    #[test]
    fn event_takes_precedence_over_action() {
        let env = Envelope::parse(r#"{"event":"discover","action":"get_schema"}"#).unwrap();
        assert_eq!(env.resolved_event(), Some("discover"));
    }

    #[test]
    fn action_used_when_event_absent() {
        let env = Envelope::parse(r#"{"action":"discover"}"#).unwrap();
        assert_eq!(env.resolved_event(), Some("discover"));
    }

    #[test]
    fn no_event_or_action() {
        let env = Envelope::parse(r#"{"zKey":"ListItems"}"#).unwrap();
        assert_eq!(env.resolved_event(), None);
    }

    #[test]
    fn underscore_request_id_is_recognized() {
        let env = Envelope::parse(r#"{"event":"execute_walker","_requestId":42}"#).unwrap();
        let corr = env.correlation().unwrap();
        assert_eq!(corr.key, "_requestId");
        assert_eq!(corr.value, serde_json::json!(42));
    }

    #[test]
    fn request_id_preferred_over_underscore_variant() {
        let env = Envelope::parse(r#"{"requestId":1,"_requestId":2}"#).unwrap();
        assert_eq!(env.correlation().unwrap().key, "requestId");
    }

    #[test]
    fn null_request_id_is_absent() {
        let env = Envelope::parse(r#"{"event":"discover","requestId":null}"#).unwrap();
        assert!(env.correlation().is_none());
    }

    #[test]
    fn echo_preserves_token_verbatim() {
        let env = Envelope::parse(r#"{"event":"x","requestId":"opaque-abc"}"#).unwrap();
        let reply = ok_reply(serde_json::json!("done"), env.correlation().as_ref());
        assert_eq!(reply["requestId"], "opaque-abc");
        assert_eq!(reply["result"], "done");
    }

    #[test]
    fn echo_uses_original_key() {
        let env = Envelope::parse(r#"{"event":"load_page","_requestId":9}"#).unwrap();
        let reply = ok_reply(serde_json::json!("completed"), env.correlation().as_ref());
        assert_eq!(reply["_requestId"], 9);
        assert!(reply.get("requestId").is_none());
    }

    #[test]
    fn no_correlation_means_no_echo() {
        let reply = error_reply("boom", None);
        assert_eq!(reply["error"], "boom");
        assert!(reply.get("requestId").is_none());
    }

    #[test]
    fn require_str_extracts() {
        let env = Envelope::parse(r#"{"model":"invoice","count":5}"#).unwrap();
        assert_eq!(env.require_str("model").unwrap(), "invoice");
        assert!(env.require_str("missing").is_err());
        assert!(env.require_str("count").is_err()); // not a string
    }

    #[test]
    fn optional_helpers() {
        let env = Envelope::parse(r#"{"ttl":30,"no_cache":true,"model":"m"}"#).unwrap();
        assert_eq!(env.optional_i64("ttl"), Some(30));
        assert_eq!(env.optional_bool("no_cache"), Some(true));
        assert_eq!(env.optional_str("model"), Some("m"));
        assert_eq!(env.optional_str("absent"), None);
    }
}
