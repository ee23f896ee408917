use serde_json::{Map, Value};
use std::collections::HashSet;

use super::types::{ErrorObject, Id, JSONRPC_VERSION};

/// Violations that make the stream unusable. The read loop disconnects on
/// any of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("message is missing the jsonrpc version tag")]
    MissingVersion,

    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),
}

/// One inbound JSON object, decoded but not yet routed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub jsonrpc: String,
    /// Raw `id` member, kept as received
    pub id: Option<Value>,
    pub method: Option<String>,
    pub params: Option<Value>,
    /// Present-but-null results are `Some(Value::Null)`
    pub result: Option<Value>,
    pub error: Option<ErrorObject>,
    /// Allow-listed out-of-protocol fields
    pub meta: Map<String, Value>,
    /// Fields nobody asked for, kept for diagnostics
    pub unexpected: Map<String, Value>,
    /// Shape problems found while decoding
    pub problems: Vec<String>,
}

/// Derived classification of an [`IncomingMessage`]
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Request(Id),
    Notification,
    /// Response with the id it answers; `None` for `id: null`
    Response(Option<Id>),
    Invalid {
        id: Option<Id>,
        reason: String,
    },
}

impl IncomingMessage {
    /// Decode a top-level object. Only the version tag is fatal; other
    /// problems are recorded and surface through [`IncomingMessage::kind`].
    pub fn parse(
        mut object: Map<String, Value>,
        allowed_meta: &HashSet<String>,
    ) -> Result<Self, ProtocolViolation> {
        let jsonrpc = match object.remove("jsonrpc") {
            None => return Err(ProtocolViolation::MissingVersion),
            Some(Value::String(version)) if version == JSONRPC_VERSION => version,
            Some(other) => return Err(ProtocolViolation::UnsupportedVersion(other.to_string())),
        };

        let mut message = IncomingMessage {
            jsonrpc,
            ..Default::default()
        };

        message.id = object.remove("id");

        match object.remove("method") {
            None => {}
            Some(Value::String(method)) => message.method = Some(method),
            Some(_) => message.problems.push("method must be a string".to_string()),
        }

        message.params = object.remove("params");
        message.result = object.remove("result");

        if let Some(error) = object.remove("error") {
            match serde_json::from_value::<ErrorObject>(error) {
                Ok(error) => message.error = Some(error),
                Err(e) => message
                    .problems
                    .push(format!("malformed error object: {}", e)),
            }
        }

        for (key, value) in object {
            if allowed_meta.contains(&key) {
                message.meta.insert(key, value);
            } else {
                message.unexpected.insert(key, value);
            }
        }

        Ok(message)
    }

    /// Valid request/response id, if any
    pub fn id(&self) -> Option<Id> {
        self.id.as_ref().and_then(Id::from_value)
    }

    /// Looks like a response (carries result or error and no method)
    pub fn is_response_like(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn kind(&self) -> MessageKind {
        let id = self.id();

        if let Some(reason) = self.invalid_reason() {
            return MessageKind::Invalid { id, reason };
        }

        if self.method.is_some() {
            return match (&self.id, id) {
                (None, _) => MessageKind::Notification,
                (Some(_), Some(id)) => MessageKind::Request(id),
                (Some(raw), None) => MessageKind::Invalid {
                    id: None,
                    reason: format!("invalid request id: {}", raw),
                },
            };
        }

        if self.result.is_some() || self.error.is_some() {
            return match (&self.id, id) {
                (Some(_), Some(id)) => MessageKind::Response(Some(id)),
                (Some(Value::Null), None) => MessageKind::Response(None),
                _ => MessageKind::Invalid {
                    id: None,
                    reason: "response without a valid id".to_string(),
                },
            };
        }

        MessageKind::Invalid {
            id,
            reason: "message has neither method nor result/error".to_string(),
        }
    }

    fn invalid_reason(&self) -> Option<String> {
        let mut reasons = self.problems.clone();

        if !self.unexpected.is_empty() {
            let names: Vec<&str> = self.unexpected.keys().map(String::as_str).collect();
            reasons.push(format!("unexpected field(s): {}", names.join(", ")));
        }

        if self.method.is_some() && (self.result.is_some() || self.error.is_some()) {
            reasons.push("request carries result or error".to_string());
        }

        if self.result.is_some() && self.error.is_some() {
            reasons.push("response carries both result and error".to_string());
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }

    /// Split a response into its outcome
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Scratch state for the message the read loop is currently decoding.
/// Reset before every top-level value.
#[derive(Debug, Default)]
pub struct DecodeContext {
    sequence: u64,
    batch_index: Option<usize>,
    method: Option<String>,
    id: Option<Id>,
}

impl DecodeContext {
    pub fn reset(&mut self) {
        self.sequence += 1;
        self.batch_index = None;
        self.method = None;
        self.id = None;
    }

    /// Number of top-level values seen so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn enter_batch_element(&mut self, index: usize) {
        self.batch_index = Some(index);
        self.method = None;
        self.id = None;
    }

    pub fn record(&mut self, message: &IncomingMessage) {
        self.method = message.method.clone();
        self.id = message.id();
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Short location string for log lines
    pub fn describe(&self) -> String {
        let mut out = format!("#{}", self.sequence);
        if let Some(index) = self.batch_index {
            out.push_str(&format!("[{}]", index));
        }
        if let Some(method) = &self.method {
            out.push_str(&format!(" {}", method));
        }
        if let Some(id) = &self.id {
            out.push_str(&format!(" id={}", id));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<IncomingMessage, ProtocolViolation> {
        parse_with(value, &[])
    }

    fn parse_with(value: Value, meta: &[&str]) -> Result<IncomingMessage, ProtocolViolation> {
        let allowed: HashSet<String> = meta.iter().map(|s| s.to_string()).collect();
        match value {
            Value::Object(map) => IncomingMessage::parse(map, &allowed),
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn test_request_classification() {
        let message = parse(json!({"jsonrpc": "2.0", "id": 1, "method": "noop", "params": []})).unwrap();
        assert_eq!(message.kind(), MessageKind::Request(Id::Number(1)));
        assert_eq!(message.params, Some(json!([])));
    }

    #[test]
    fn test_notification_classification() {
        let message = parse(json!({"jsonrpc": "2.0", "method": "tick"})).unwrap();
        assert_eq!(message.kind(), MessageKind::Notification);
    }

    #[test]
    fn test_response_classification() {
        let message = parse(json!({"jsonrpc": "2.0", "id": "a", "result": null})).unwrap();
        assert_eq!(message.kind(), MessageKind::Response(Some(Id::from("a"))));
        assert_eq!(message.into_outcome(), Ok(Value::Null));

        let message = parse(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        assert_eq!(message.kind(), MessageKind::Response(Some(Id::Number(4))));
        let error = message.into_outcome().unwrap_err();
        assert_eq!(error.code, -32601);
    }

    #[test]
    fn test_error_response_with_null_id() {
        let message = parse(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        assert_eq!(message.kind(), MessageKind::Response(None));
    }

    #[test]
    fn test_missing_or_wrong_version_is_fatal() {
        assert_eq!(
            parse(json!({"id": 1, "method": "x"})),
            Err(ProtocolViolation::MissingVersion)
        );
        assert!(matches!(
            parse(json!({"jsonrpc": "1.0", "id": 1, "method": "x"})),
            Err(ProtocolViolation::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_unexpected_fields_make_message_invalid() {
        let message = parse(json!({"jsonrpc": "2.0", "id": 2, "method": "x", "trace": "t"})).unwrap();
        match message.kind() {
            MessageKind::Invalid { id, reason } => {
                assert_eq!(id, Some(Id::Number(2)));
                assert!(reason.contains("trace"));
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_allow_listed_meta_is_accepted() {
        let message =
            parse_with(json!({"jsonrpc": "2.0", "id": 2, "method": "x", "trace": "t"}), &["trace"]).unwrap();
        assert_eq!(message.kind(), MessageKind::Request(Id::Number(2)));
        assert_eq!(message.meta.get("trace"), Some(&json!("t")));
        assert!(message.unexpected.is_empty());
    }

    #[test]
    fn test_bad_shapes_are_invalid() {
        let message = parse(json!({"jsonrpc": "2.0", "id": 1, "method": 5})).unwrap();
        assert!(matches!(message.kind(), MessageKind::Invalid { .. }));

        let message = parse(json!({"jsonrpc": "2.0", "id": [1], "method": "x"})).unwrap();
        assert!(matches!(message.kind(), MessageKind::Invalid { id: None, .. }));

        let message = parse(json!({"jsonrpc": "2.0", "id": 1})).unwrap();
        assert!(matches!(message.kind(), MessageKind::Invalid { .. }));

        let message = parse(json!({"jsonrpc": "2.0", "id": 1, "error": "boom"})).unwrap();
        assert!(matches!(message.kind(), MessageKind::Invalid { .. }));

        let message = parse(json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "m"}})).unwrap();
        assert!(matches!(message.kind(), MessageKind::Invalid { .. }));
    }

    #[test]
    fn test_decode_context_reset() {
        let mut ctx = DecodeContext::default();
        ctx.reset();
        let message = parse(json!({"jsonrpc": "2.0", "id": 9, "method": "sum"})).unwrap();
        ctx.record(&message);
        assert_eq!(ctx.describe(), "#1 sum id=9");

        ctx.reset();
        assert_eq!(ctx.sequence(), 2);
        assert_eq!(ctx.method(), None);
        assert_eq!(ctx.describe(), "#2");
    }
}
