use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSONRPC version tag carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier (integer or string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl Id {
    /// Interpret a raw JSON value as an id. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Id::Number),
            Value::String(s) => Some(Id::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{}", n),
            Id::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

/// Request parameters - either positional or named
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Empty positional parameter list
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    /// Accept a raw `params` member. Absent params become an empty list;
    /// anything other than an array or object is rejected.
    pub fn from_value(value: Option<Value>) -> Result<Self, String> {
        match value {
            None => Ok(Params::none()),
            Some(Value::Array(items)) => Ok(Params::Positional(items)),
            Some(Value::Object(map)) => Ok(Params::Named(map)),
            Some(other) => Err(format!(
                "params must be an array or an object, got {}",
                kind_name(&other)
            )),
        }
    }

    /// Serialize any value into parameters. Structs and maps become named
    /// parameters, sequences and tuples become positional ones.
    pub fn to_params<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        match value {
            Value::Null => Ok(Params::none()),
            Value::Array(items) => Ok(Params::Positional(items)),
            Value::Object(map) => Ok(Params::Named(map)),
            other => Ok(Params::Positional(vec![other])),
        }
    }

    /// Deserialize the parameters into a typed value
    pub fn parse<T: serde::de::DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.into_value())
    }

    pub fn into_value(self) -> Value {
        match self {
            Params::Positional(items) => Value::Array(items),
            Params::Named(map) => Value::Object(map),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Params::Positional(items) => items.len(),
            Params::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(items: Vec<Value>) -> Self {
        Params::Positional(items)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Named(map)
    }
}

/// Same mapping as [`Params::to_params`]: null is empty, a scalar becomes a
/// one-element list
impl From<Value> for Params {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Params::none(),
            Value::Array(items) => Params::Positional(items),
            Value::Object(map) => Params::Named(map),
            other => Params::Positional(vec![other]),
        }
    }
}

/// JSONRPC 2.0 Error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error type indicator (must be integer)
    pub code: i64,

    /// Short error description
    pub message: String,

    /// Additional error information (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object with the standard message for `code`
    pub fn new(code: ErrorCode, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data,
        }
    }

    /// Create a custom error
    pub fn custom(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// Pre-defined JSONRPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
        }
    }
}

/// Outbound request or notification (`id` absent)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Request {
    pub jsonrpc: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,

    pub method: String,

    pub params: Params,

    /// Allow-listed out-of-protocol fields
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl Request {
    pub fn new(id: Option<Id>, method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Check if this is a notification (no id)
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Success or error payload of a response
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

/// Outbound response. `id` serializes as `null` when the request id could
/// not be determined.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Response {
    pub jsonrpc: &'static str,

    pub id: Option<Id>,

    #[serde(flatten)]
    pub outcome: Outcome,

    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl Response {
    /// Create a success response
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            outcome: Outcome::Result(result),
            meta: Map::new(),
        }
    }

    /// Create an error response
    pub fn error(id: Option<Id>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: Outcome::Error(error),
            meta: Map::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = Request::new(Some(Id::Number(1)), "subtract", vec![json!(42), json!(23)].into());

        let json = serde_json::to_string(&request).unwrap();
        let expected = r#"{"jsonrpc":"2.0","id":1,"method":"subtract","params":[42,23]}"#;
        assert_eq!(json, expected);
    }

    #[test]
    fn test_notification() {
        let notification = Request::new(None, "update", vec![json!(1), json!(2)].into());

        assert!(notification.is_notification());

        let json = serde_json::to_string(&notification).unwrap();
        let expected = r#"{"jsonrpc":"2.0","method":"update","params":[1,2]}"#;
        assert_eq!(json, expected);
    }

    #[test]
    fn test_request_meta_fields_are_flattened() {
        let mut meta = Map::new();
        meta.insert("trace".to_string(), json!("abc"));
        let request = Request::new(Some(Id::from("x")), "ping", Params::none()).with_meta(meta);

        let value = request.to_value();
        assert_eq!(value["trace"], json!("abc"));
        assert_eq!(value["id"], json!("x"));
    }

    #[test]
    fn test_response_success() {
        let response = Response::success(Id::Number(1), json!(19));

        let json = serde_json::to_string(&response).unwrap();
        let expected = r#"{"jsonrpc":"2.0","id":1,"result":19}"#;
        assert_eq!(json, expected);
    }

    #[test]
    fn test_response_null_result_is_kept() {
        let response = Response::success(Id::Number(3), Value::Null);
        assert_eq!(response.to_value(), json!({"jsonrpc": "2.0", "id": 3, "result": null}));
    }

    #[test]
    fn test_response_error() {
        let error = ErrorObject::new(ErrorCode::MethodNotFound, None);
        let response = Response::error(Some(Id::from("1")), error);

        let json = serde_json::to_string(&response).unwrap();
        let expected =
            r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"Method not found"}}"#;
        assert_eq!(json, expected);
    }

    #[test]
    fn test_error_response_without_id() {
        let response = Response::error(None, ErrorObject::new(ErrorCode::InvalidRequest, None));
        assert_eq!(response.to_value()["id"], Value::Null);
    }

    #[test]
    fn test_params_from_value() {
        assert_eq!(Params::from_value(None).unwrap(), Params::none());
        assert!(matches!(
            Params::from_value(Some(json!({"a": 1}))).unwrap(),
            Params::Named(_)
        ));
        assert!(Params::from_value(Some(json!(5))).is_err());
    }

    #[test]
    fn test_to_params_from_struct_and_tuple() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let named = Params::to_params(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(named.into_value(), json!({"x": 1, "y": 2}));

        let positional = Params::to_params(&(1, "a")).unwrap();
        assert_eq!(positional.into_value(), json!([1, "a"]));
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(Id::from_value(&json!(7)), Some(Id::Number(7)));
        assert_eq!(Id::from_value(&json!("a")), Some(Id::from("a")));
        assert_eq!(Id::from_value(&json!(1.5)), None);
        assert_eq!(Id::from_value(&Value::Null), None);
    }
}
