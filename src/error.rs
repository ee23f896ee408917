//! Error taxonomy.
//!
//! Two disjoint families: [`RemoteError`] is what the partner reported in a
//! JSON-RPC error object, every other [`RpcError`] variant is a failure on
//! this side of the wire.

use serde_json::Value;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::jsonrpc::codec::CodecError;
use crate::jsonrpc::types::{ErrorCode, ErrorObject, Id};

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Category of a remote error, derived from its code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// Any code outside the predefined set
    Application,
}

impl RemoteErrorKind {
    pub fn from_code(code: i64) -> Self {
        match ErrorCode::from_code(code) {
            Some(ErrorCode::ParseError) => RemoteErrorKind::ParseError,
            Some(ErrorCode::InvalidRequest) => RemoteErrorKind::InvalidRequest,
            Some(ErrorCode::MethodNotFound) => RemoteErrorKind::MethodNotFound,
            Some(ErrorCode::InvalidParams) => RemoteErrorKind::InvalidParams,
            Some(ErrorCode::InternalError) => RemoteErrorKind::InternalError,
            None => RemoteErrorKind::Application,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::ParseError => "parse error",
            RemoteErrorKind::InvalidRequest => "invalid request",
            RemoteErrorKind::MethodNotFound => "method not found",
            RemoteErrorKind::InvalidParams => "invalid params",
            RemoteErrorKind::InternalError => "internal error",
            RemoteErrorKind::Application => "application error",
        };
        f.write_str(name)
    }
}

/// Error reported by the partner for one of our calls
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("remote {kind} [{code}]: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
    /// Method of the call that triggered the error
    pub method: Option<String>,
    pub id: Option<Id>,
}

impl RemoteError {
    pub fn from_object(error: ErrorObject, method: Option<String>, id: Option<Id>) -> Self {
        Self {
            kind: RemoteErrorKind::from_code(error.code),
            code: error.code,
            message: error.message,
            data: error.data,
            method,
            id,
        }
    }

    pub fn to_object(&self) -> ErrorObject {
        ErrorObject::custom(self.code, self.message.clone(), self.data.clone())
    }
}

/// RPC error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("wait interrupted before the call completed")]
    Interrupted,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    /// Code of the remote error, if this is one
    pub fn code(&self) -> Option<i64> {
        self.remote().map(|remote| remote.code)
    }
}

impl From<CodecError> for RpcError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io(e) => RpcError::Io(e),
            CodecError::Json(e) => RpcError::Serialization(e.to_string()),
            other => RpcError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_codes_map_to_kinds() {
        let cases = [
            (-32700, RemoteErrorKind::ParseError),
            (-32600, RemoteErrorKind::InvalidRequest),
            (-32601, RemoteErrorKind::MethodNotFound),
            (-32602, RemoteErrorKind::InvalidParams),
            (-32603, RemoteErrorKind::InternalError),
            (-32000, RemoteErrorKind::Application),
            (42, RemoteErrorKind::Application),
        ];
        for (code, kind) in cases {
            assert_eq!(RemoteErrorKind::from_code(code), kind, "code {}", code);
        }
    }

    #[test]
    fn test_remote_error_carries_request() {
        let object = ErrorObject::custom(-32001, "busy", Some(json!({"retry": 5})));
        let remote = RemoteError::from_object(object.clone(), Some("query".into()), Some(Id::Number(3)));

        assert_eq!(remote.kind, RemoteErrorKind::Application);
        assert_eq!(remote.method.as_deref(), Some("query"));
        assert_eq!(remote.to_object(), object);

        let error = RpcError::from(remote);
        assert!(error.is_remote());
        assert_eq!(error.code(), Some(-32001));
        assert_eq!(error.to_string(), "remote application error [-32001]: busy");
    }

    #[test]
    fn test_local_errors_are_not_remote() {
        assert!(!RpcError::ConnectionClosed.is_remote());
        assert!(!RpcError::Timeout(Duration::from_millis(5)).is_remote());
        assert_eq!(RpcError::Cancelled.code(), None);
    }
}
