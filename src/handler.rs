//! Handler registry: request handlers, request signatures and
//! notification inducers, keyed by method name.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::jsonrpc::params::{ParamShape, ValueKind};
use crate::jsonrpc::types::{ErrorCode, Id, Params};

/// Error kind used for failures without a more specific kind
pub const KIND_INTERNAL: &str = "internal";
/// Error kind for parameters a handler could not accept
pub const KIND_INVALID_PARAMS: &str = "invalid_params";
/// Error kind reported when a handler panics
pub const KIND_PANIC: &str = "panic";

/// Failure raised by a request handler. Turned into an error response by
/// looking up `kind` in the agent's [`ErrorCodeMap`] unless `code` is set.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    pub data: Option<Value>,
    pub code: Option<i64>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: None,
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(KIND_INTERNAL, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(KIND_INVALID_PARAMS, message)
    }

    /// Error with an explicit JSON-RPC code, bypassing the code map
    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(KIND_INTERNAL, message)
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::internal(format!("{:#}", error))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::invalid_params(error.to_string())
    }
}

/// Map from handler error kind to JSON-RPC error code
#[derive(Debug, Clone)]
pub struct ErrorCodeMap {
    codes: HashMap<String, i64>,
    default_code: i64,
}

impl ErrorCodeMap {
    pub fn new() -> Self {
        let mut codes = HashMap::new();
        codes.insert(KIND_INVALID_PARAMS.to_string(), ErrorCode::InvalidParams.code());
        codes.insert(KIND_INTERNAL.to_string(), ErrorCode::InternalError.code());
        Self {
            codes,
            default_code: ErrorCode::InternalError.code(),
        }
    }

    pub fn insert(&mut self, kind: impl Into<String>, code: i64) {
        self.codes.insert(kind.into(), code);
    }

    pub fn code_for(&self, error: &HandlerError) -> i64 {
        error
            .code
            .or_else(|| self.codes.get(&error.kind).copied())
            .unwrap_or(self.default_code)
    }

    pub fn code_for_kind(&self, kind: &str) -> i64 {
        self.codes.get(kind).copied().unwrap_or(self.default_code)
    }
}

impl Default for ErrorCodeMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an inbound request runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the connection's read loop, one request at a time. The loop reads
    /// nothing else meanwhile, so an inline handler must not wait on a call
    /// to the same partner.
    Inline,
    /// On the agent's shared worker pool
    Pooled,
}

/// Everything a handler gets to know about the request it serves
#[derive(Clone)]
pub struct RequestContext {
    pub connection: Arc<Connection>,
    pub id: Id,
    pub method: String,
    /// Allow-listed meta fields of the request
    pub meta: Map<String, Value>,
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext, params: Params) -> Result<Value, HandlerError>;
}

/// Handler backed by a closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, params: Params) -> Result<Value, HandlerError> {
        (self.f)(ctx, params).await
    }
}

/// Wrap a closure taking raw parameters
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

/// Handler that deserializes its parameters into `P` and serializes its
/// result from `R`
pub struct TypedHandler<P, R, F> {
    f: F,
    _types: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<P, R, F, Fut> RequestHandler for TypedHandler<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, params: Params) -> Result<Value, HandlerError> {
        let params: P = params.parse()?;
        let result = (self.f)(ctx, params).await?;
        serde_json::to_value(result)
            .map_err(|e| HandlerError::internal(format!("failed to serialize result: {}", e)))
    }
}

pub fn typed_handler<P, R, F, Fut>(f: F) -> TypedHandler<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

/// A registered request handler
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn RequestHandler>,
    pub mode: ExecutionMode,
}

/// Declared parameter shape and result kind of a method
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSignature {
    pub params: ParamShape,
    pub result: ValueKind,
}

impl RequestSignature {
    pub fn new(params: ParamShape, result: ValueKind) -> Self {
        Self { params, result }
    }
}

/// Notification decoded by an inducer, ready to run on the notification task
pub struct InducedNotification {
    method: String,
    run: Box<dyn FnOnce(Arc<Connection>) -> BoxFuture<'static, ()> + Send>,
}

impl InducedNotification {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn deliver(self, connection: Arc<Connection>) {
        (self.run)(connection).await
    }
}

impl std::fmt::Debug for InducedNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InducedNotification")
            .field("method", &self.method)
            .finish()
    }
}

/// Turns the raw params of one notification method into a typed value and
/// the callback that processes it
pub trait NotificationInducer: Send + Sync + 'static {
    fn induce(&self, method: &str, params: Option<Value>) -> RpcResult<InducedNotification>;
}

struct TypedInducer<N, F> {
    callback: Arc<F>,
    _notification: PhantomData<fn() -> N>,
}

impl<N, F, Fut> NotificationInducer for TypedInducer<N, F>
where
    N: DeserializeOwned + Send + 'static,
    F: Fn(Arc<Connection>, N) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn induce(&self, method: &str, params: Option<Value>) -> RpcResult<InducedNotification> {
        let notification: N = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Deserialization(format!("{} params: {}", method, e)))?;
        let callback = self.callback.clone();
        Ok(InducedNotification {
            method: method.to_string(),
            run: Box::new(move |connection| Box::pin((*callback)(connection, notification))),
        })
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Method tables consulted by every connection of an agent. Read-mostly
/// after setup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    signatures: RwLock<HashMap<String, RequestSignature>>,
    inducers: RwLock<HashMap<String, Arc<dyn NotificationInducer>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request_handler<H: RequestHandler>(
        &self,
        method: impl Into<String>,
        handler: H,
        mode: ExecutionMode,
    ) {
        let entry = HandlerEntry {
            handler: Arc::new(handler),
            mode,
        };
        write(&self.handlers).insert(method.into(), entry);
    }

    pub fn request_handler(&self, method: &str) -> Option<HandlerEntry> {
        read(&self.handlers).get(method).cloned()
    }

    pub fn unregister_request_handler(&self, method: &str) -> Option<HandlerEntry> {
        write(&self.handlers).remove(method)
    }

    pub fn register_request_signature(
        &self,
        method: impl Into<String>,
        params: ParamShape,
        result: ValueKind,
    ) {
        write(&self.signatures).insert(method.into(), RequestSignature::new(params, result));
    }

    pub fn request_signature(&self, method: &str) -> Option<RequestSignature> {
        read(&self.signatures).get(method).cloned()
    }

    pub fn unregister_request_signature(&self, method: &str) -> Option<RequestSignature> {
        write(&self.signatures).remove(method)
    }

    /// Register how to decode and handle notification `method`. The params
    /// are deserialized into `N` on the read loop; `callback` runs on the
    /// connection's notification task.
    pub fn register_notification_inducer<N, F, Fut>(&self, method: impl Into<String>, callback: F)
    where
        N: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Connection>, N) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inducer = TypedInducer {
            callback: Arc::new(callback),
            _notification: PhantomData::<fn() -> N>,
        };
        self.register_inducer(method, Arc::new(inducer));
    }

    /// Register a hand-written inducer
    pub fn register_inducer(&self, method: impl Into<String>, inducer: Arc<dyn NotificationInducer>) {
        write(&self.inducers).insert(method.into(), inducer);
    }

    pub fn notification_inducer(&self, method: &str) -> Option<Arc<dyn NotificationInducer>> {
        read(&self.inducers).get(method).cloned()
    }

    pub fn unregister_notification_inducer(
        &self,
        method: &str,
    ) -> Option<Arc<dyn NotificationInducer>> {
        write(&self.inducers).remove(method)
    }

    pub fn request_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = read(&self.handlers).keys().cloned().collect();
        methods.sort();
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_error_code_map_resolution() {
        let mut map = ErrorCodeMap::new();
        map.insert("not_found", -32004);

        assert_eq!(map.code_for(&HandlerError::new("not_found", "gone")), -32004);
        assert_eq!(map.code_for(&HandlerError::invalid_params("bad")), -32602);
        assert_eq!(map.code_for(&HandlerError::new("whatever", "x")), -32603);
        assert_eq!(map.code_for(&HandlerError::with_code(-1, "explicit")), -1);
        assert_eq!(map.code_for_kind(KIND_PANIC), -32603);
    }

    #[test]
    fn test_handler_error_conversions() {
        let err: HandlerError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind, KIND_INTERNAL);
        assert_eq!(err.message, "disk full");

        let err: HandlerError = serde_json::from_value::<u32>(json!("x")).unwrap_err().into();
        assert_eq!(err.kind, KIND_INVALID_PARAMS);

        let err = HandlerError::new("quota", "limit").data(json!({"max": 3}));
        assert_eq!(err.data, Some(json!({"max": 3})));
    }

    #[test]
    fn test_registry_register_get_unregister() {
        let registry = HandlerRegistry::new();
        registry.register_request_handler(
            "ping",
            handler_fn(|_ctx, _params| async { Ok::<_, HandlerError>(json!("pong")) }),
            ExecutionMode::Inline,
        );
        registry.register_request_signature("ping", ParamShape::positional(), ValueKind::String);

        let entry = registry.request_handler("ping").unwrap();
        assert_eq!(entry.mode, ExecutionMode::Inline);
        assert_eq!(
            registry.request_signature("ping").unwrap().result,
            ValueKind::String
        );
        assert_eq!(registry.request_methods(), vec!["ping".to_string()]);

        assert!(registry.unregister_request_handler("ping").is_some());
        assert!(registry.request_handler("ping").is_none());
        assert!(registry.unregister_request_signature("ping").is_some());
        assert!(registry.request_signature("ping").is_none());
    }

    #[test]
    fn test_inducer_decodes_typed_params() {
        #[derive(Deserialize)]
        struct Progress {
            done: u32,
        }

        let registry = HandlerRegistry::new();
        registry.register_notification_inducer("progress", |_conn, progress: Progress| async move {
            let _ = progress.done;
        });

        let inducer = registry.notification_inducer("progress").unwrap();
        let induced = inducer.induce("progress", Some(json!({"done": 3}))).unwrap();
        assert_eq!(induced.method(), "progress");

        let err = inducer.induce("progress", Some(json!({"done": "x"}))).unwrap_err();
        assert!(matches!(err, RpcError::Deserialization(_)));

        assert!(registry.unregister_notification_inducer("progress").is_some());
        assert!(registry.notification_inducer("progress").is_none());
    }
}
