//! Agent: the process-side owner of connections, handlers and the worker
//! pool.

use anyhow::Context;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::batch::Batch;
use crate::connection::{Connection, DisconnectHook, DisconnectReason};
use crate::error::{RpcError, RpcResult};
use crate::handler::{ErrorCodeMap, ExecutionMode, HandlerRegistry, RequestHandler};
use crate::jsonrpc::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::jsonrpc::params::{ParamShape, ValueKind};
use crate::jsonrpc::types::{Id, Params};
use crate::pool::WorkerPool;
use crate::request::{CallHandle, OutboundRequest};

/// Agent settings. Every field has a default, so a config file only needs
/// the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Used in log lines
    pub name: String,
    /// Inbound notifications buffered per connection before the read loop
    /// waits
    pub notification_queue_capacity: usize,
    /// Pooled handlers running at once, across all connections
    pub max_pool_workers: usize,
    /// Check outbound params against the prototype's shape before writing
    pub validate_params: bool,
    /// Default timeout for synchronous calls
    pub call_timeout_ms: Option<u64>,
    pub max_message_size: usize,
    /// Out-of-protocol fields accepted on inbound messages
    pub inbound_meta: Vec<String>,
    /// Out-of-protocol fields allowed on outbound messages
    pub outbound_meta: Vec<String>,
    /// Handler error kind to JSON-RPC error code
    pub error_codes: HashMap<String, i64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            notification_queue_capacity: 64,
            max_pool_workers: 16,
            validate_params: true,
            call_timeout_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbound_meta: Vec::new(),
            outbound_meta: Vec::new(),
            error_codes: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// State shared by the agent and all of its connections
pub(crate) struct AgentCore {
    pub(crate) config: AgentConfig,
    pub(crate) registry: HandlerRegistry,
    pub(crate) error_codes: ErrorCodeMap,
    pub(crate) pool: WorkerPool,
    pub(crate) disconnect_hook: Option<DisconnectHook>,
    next_call_id: AtomicI64,
    next_connection_id: AtomicU64,
    inbound_meta: RwLock<HashSet<String>>,
    outbound_meta: RwLock<HashSet<String>>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl AgentCore {
    /// Agent-wide call id; never reused
    pub(crate) fn next_call_id(&self) -> Id {
        Id::Number(self.next_call_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn inbound_meta(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.inbound_meta.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_outbound_meta(&self, meta: &Map<String, Value>) -> RpcResult<()> {
        if meta.is_empty() {
            return Ok(());
        }
        let allowed = self.outbound_meta.read().unwrap_or_else(PoisonError::into_inner);
        match meta.keys().find(|key| !allowed.contains(*key)) {
            Some(key) => Err(RpcError::Serialization(format!(
                "meta field `{}` is not allowed on outbound messages",
                key
            ))),
            None => Ok(()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track_connection(&self, connection: Arc<Connection>) {
        self.connections().insert(connection.id(), connection);
    }

    pub(crate) fn forget_connection(&self, id: u64) {
        self.connections().remove(&id);
    }
}

pub struct AgentBuilder {
    config: AgentConfig,
    error_codes: ErrorCodeMap,
    disconnect_hook: Option<DisconnectHook>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::from_config(AgentConfig::default())
    }

    pub fn from_config(config: AgentConfig) -> Self {
        Self {
            config,
            error_codes: ErrorCodeMap::new(),
            disconnect_hook: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn notification_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_queue_capacity = capacity;
        self
    }

    pub fn max_pool_workers(mut self, workers: usize) -> Self {
        self.config.max_pool_workers = workers;
        self
    }

    pub fn validate_params(mut self, validate: bool) -> Self {
        self.config.validate_params = validate;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn allow_inbound_meta(mut self, field: impl Into<String>) -> Self {
        self.config.inbound_meta.push(field.into());
        self
    }

    pub fn allow_outbound_meta(mut self, field: impl Into<String>) -> Self {
        self.config.outbound_meta.push(field.into());
        self
    }

    /// Answer handler errors of `kind` with `code`
    pub fn map_error(mut self, kind: impl Into<String>, code: i64) -> Self {
        self.error_codes.insert(kind, code);
        self
    }

    /// Run `hook` once for every connection that goes down
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection, &DisconnectReason) + Send + Sync + 'static,
    {
        self.disconnect_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Agent {
        let mut error_codes = self.error_codes;
        for (kind, code) in &self.config.error_codes {
            error_codes.insert(kind.clone(), *code);
        }

        let core = AgentCore {
            registry: HandlerRegistry::new(),
            error_codes,
            pool: WorkerPool::new(self.config.max_pool_workers),
            disconnect_hook: self.disconnect_hook,
            next_call_id: AtomicI64::new(1),
            next_connection_id: AtomicU64::new(1),
            inbound_meta: RwLock::new(self.config.inbound_meta.iter().cloned().collect()),
            outbound_meta: RwLock::new(self.config.outbound_meta.iter().cloned().collect()),
            connections: Mutex::new(HashMap::new()),
            config: self.config,
        };

        debug!(
            "Agent {} built ({} pool workers)",
            core.config.name,
            core.pool.size()
        );
        Agent {
            core: Arc::new(core),
        }
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of any number of JSON-RPC connections.
///
/// Handlers registered on the agent serve requests from every connection.
/// Dropping the agent shuts all of its connections down.
pub struct Agent {
    core: Arc<AgentCore>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        AgentBuilder::from_config(config).build()
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    pub fn register_request_handler<H: RequestHandler>(
        &self,
        method: impl Into<String>,
        handler: H,
        mode: ExecutionMode,
    ) {
        self.core
            .registry
            .register_request_handler(method, handler, mode)
    }

    pub fn register_request_signature(
        &self,
        method: impl Into<String>,
        params: ParamShape,
        result: ValueKind,
    ) {
        self.core
            .registry
            .register_request_signature(method, params, result)
    }

    pub fn register_notification_inducer<N, F, Fut>(&self, method: impl Into<String>, callback: F)
    where
        N: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Connection>, N) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.core
            .registry
            .register_notification_inducer(method, callback)
    }

    pub fn allow_inbound_meta(&self, field: impl Into<String>) {
        self.core
            .inbound_meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.into());
    }

    pub fn allow_outbound_meta(&self, field: impl Into<String>) {
        self.core
            .outbound_meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.into());
    }

    /// Prototype for a method with a registered signature
    pub fn prototype<R: DeserializeOwned>(&self, method: &str) -> RpcResult<OutboundRequest<R>> {
        self.core
            .registry
            .request_signature(method)
            .map(|signature| OutboundRequest::from_signature(method, &signature))
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    /// Start serving a stream pair. Must be called inside a tokio runtime.
    pub fn connect<R, W>(&self, reader: R, writer: W, name: impl Into<String>) -> Arc<Connection>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Connection::open(
            self.core.clone(),
            name.into(),
            Box::new(reader),
            Box::new(writer),
        )
    }

    /// Start serving a bidirectional stream
    pub fn connect_stream<S>(&self, stream: S, name: impl Into<String>) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.connect(reader, writer, name)
    }

    /// Live connections, oldest first
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> =
            self.core.connections().values().cloned().collect();
        connections.sort_by_key(|connection| connection.id());
        connections
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.core.connections().get(&id).cloned()
    }

    pub async fn call<R: DeserializeOwned>(
        &self,
        connection: &Connection,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<R> {
        connection.call(method, params).await
    }

    pub async fn call_async<R: DeserializeOwned>(
        &self,
        connection: &Connection,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<CallHandle<R>> {
        connection.call_async(method, params).await
    }

    pub async fn notify(
        &self,
        connection: &Connection,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<()> {
        connection.notify(method, params).await
    }

    pub fn batch(&self) -> Batch {
        Batch::new()
    }

    /// Collect a batch with `f` and submit it if `f` succeeds. On error
    /// nothing is written.
    pub async fn run_batch<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Batch) -> Result<T, E>,
        E: From<RpcError>,
    {
        let mut batch = self.batch();
        let value = f(&mut batch)?;
        batch.submit().await?;
        Ok(value)
    }

    /// Close every connection and wait for each to finish tearing down
    pub async fn close(&self) {
        let connections = self.connections();
        info!(
            "Agent {} closing {} connection(s)",
            self.name(),
            connections.len()
        );
        for connection in connections {
            connection.close().await;
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        for connection in self.core.connections().values() {
            connection.request_shutdown();
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.core.config.name)
            .field("connections", &self.core.connections().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.notification_queue_capacity, 64);
        assert_eq!(config.max_pool_workers, 16);
        assert!(config.validate_params);
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_config_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "worker", "call_timeout_ms": 250, "error_codes": {{"not_found": -32004}}}}"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "worker");
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.error_codes.get("not_found"), Some(&-32004));
        assert_eq!(config.max_pool_workers, 16);
    }

    #[test]
    fn test_config_from_missing_file_fails() {
        let err = AgentConfig::from_file("/nonexistent/tether.json").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn test_call_ids_start_at_one_and_increase() {
        let agent = Agent::new(AgentConfig::default());
        assert_eq!(agent.core.next_call_id(), Id::Number(1));
        assert_eq!(agent.core.next_call_id(), Id::Number(2));
    }

    #[test]
    fn test_outbound_meta_allow_list() {
        let agent = Agent::builder().allow_outbound_meta("trace").build();
        let mut meta = Map::new();
        meta.insert("trace".into(), json!("t1"));
        assert!(agent.core.check_outbound_meta(&meta).is_ok());

        meta.insert("secret".into(), json!(1));
        assert!(matches!(
            agent.core.check_outbound_meta(&meta),
            Err(RpcError::Serialization(_))
        ));

        agent.allow_outbound_meta("secret");
        assert!(agent.core.check_outbound_meta(&meta).is_ok());
    }

    #[test]
    fn test_prototype_requires_signature() {
        let agent = Agent::new(AgentConfig::default());
        assert!(matches!(
            agent.prototype::<Value>("missing"),
            Err(RpcError::UnknownMethod(_))
        ));

        agent.register_request_signature(
            "add",
            ParamShape::positional().arg(ValueKind::Integer).arg(ValueKind::Integer),
            ValueKind::Integer,
        );
        let proto = agent.prototype::<i64>("add").unwrap();
        assert_eq!(proto.method(), "add");
    }

    #[test]
    fn test_config_error_codes_feed_code_map() {
        let mut config = AgentConfig::default();
        config.error_codes.insert("busy".into(), -32010);
        let agent = AgentBuilder::from_config(config).map_error("gone", -32011).build();

        assert_eq!(agent.core.error_codes.code_for_kind("busy"), -32010);
        assert_eq!(agent.core.error_codes.code_for_kind("gone"), -32011);
    }

    #[tokio::test]
    async fn test_connections_tracked_until_closed() {
        let agent = Agent::new(AgentConfig::default());
        let (local, _remote) = tokio::io::duplex(1024);
        let connection = agent.connect_stream(local, "tracked");

        assert_eq!(agent.connections().len(), 1);
        assert!(agent.connection(connection.id()).is_some());

        agent.close().await;
        assert!(agent.connections().is_empty());
        assert!(!connection.is_connected());
    }
}
