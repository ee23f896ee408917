//! Outbound request prototypes and in-flight call handles.

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::handler::RequestSignature;
use crate::jsonrpc::params::ParamShape;
use crate::jsonrpc::types::{Id, Params};
use crate::pending::PendingCalls;

/// Id of a call, filled in when the call is actually written. Batched calls
/// get theirs at submit time.
pub(crate) type IdSlot = Arc<OnceLock<Id>>;

/// Immutable template for calls to one method.
///
/// `R` is the type the result is decoded into. A prototype can be reused for
/// any number of calls on any connection.
pub struct OutboundRequest<R = Value> {
    method: String,
    shape: ParamShape,
    meta: Map<String, Value>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for OutboundRequest<R> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            shape: self.shape.clone(),
            meta: self.meta.clone(),
            _result: PhantomData,
        }
    }
}

impl<R> fmt::Debug for OutboundRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("method", &self.method)
            .field("shape", &self.shape)
            .field("meta", &self.meta)
            .finish()
    }
}

impl<R: DeserializeOwned> OutboundRequest<R> {
    /// Prototype accepting any parameters
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            shape: ParamShape::Any,
            meta: Map::new(),
            _result: PhantomData,
        }
    }

    pub fn from_signature(method: impl Into<String>, signature: &RequestSignature) -> Self {
        Self::new(method).with_params(signature.params.clone())
    }

    pub fn with_params(mut self, shape: ParamShape) -> Self {
        self.shape = shape;
        self
    }

    /// Attach an out-of-protocol field to every message built from this
    /// prototype. The agent must allow it for outbound use.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn shape(&self) -> &ParamShape {
        &self.shape
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    /// Check `params` against the declared shape
    pub fn validate(&self, params: &Params) -> RpcResult<()> {
        self.shape
            .validate(params)
            .map_err(|reason| RpcError::InvalidParams {
                method: self.method.clone(),
                reason,
            })
    }

    pub(crate) fn checked(&self, connection: &Connection, params: Params) -> RpcResult<Params> {
        if connection.core().config.validate_params {
            self.validate(&params)?;
        }
        Ok(params)
    }

    /// Send the call and wait for its result. The agent's default call
    /// timeout applies when one is configured.
    pub async fn call(&self, connection: &Connection, params: impl Into<Params>) -> RpcResult<R> {
        let handle = self.call_async(connection, params).await?;
        match connection.core().config.call_timeout() {
            Some(timeout) => handle.wait_timeout(timeout).await,
            None => handle.wait().await,
        }
    }

    /// Send the call and return a handle to its eventual result
    pub async fn call_async(
        &self,
        connection: &Connection,
        params: impl Into<Params>,
    ) -> RpcResult<CallHandle<R>> {
        let params = self.checked(connection, params.into())?;
        let (id, receiver) = connection.start_call(&self.method, params, &self.meta).await?;
        Ok(CallHandle::new(
            self.method.clone(),
            Arc::new(OnceLock::from(id)),
            receiver,
            connection.pending_table(),
        ))
    }

    /// Send as a notification; nothing is registered and no result comes back
    pub async fn notify(&self, connection: &Connection, params: impl Into<Params>) -> RpcResult<()> {
        let params = self.checked(connection, params.into())?;
        connection
            .send_notification(&self.method, params, &self.meta)
            .await
    }
}

/// Handle to an in-flight call. Awaiting it yields the decoded result.
pub struct CallHandle<R = Value> {
    method: String,
    id: IdSlot,
    receiver: oneshot::Receiver<RpcResult<Value>>,
    pending: Weak<PendingCalls>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallHandle<R> {
    pub(crate) fn new(
        method: String,
        id: IdSlot,
        receiver: oneshot::Receiver<RpcResult<Value>>,
        pending: Weak<PendingCalls>,
    ) -> Self {
        Self {
            method,
            id,
            receiver,
            pending,
            _result: PhantomData,
        }
    }

    /// Stop listening and take the call out of the connection's pending
    /// table, if it ever got there
    fn abandon(&mut self) {
        self.receiver.close();
        if let (Some(id), Some(table)) = (self.id.get(), self.pending.upgrade()) {
            table.remove(id);
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Id assigned on the wire; `None` while the call sits in an unsent batch
    pub fn id(&self) -> Option<Id> {
        self.id.get().cloned()
    }

    pub async fn wait(self) -> RpcResult<R> {
        self.await
    }

    /// Wait at most `timeout`. On expiry the call is cancelled and a late
    /// response is ignored.
    pub async fn wait_timeout(mut self, timeout: Duration) -> RpcResult<R> {
        match tokio::time::timeout(timeout, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Call {} (id: {:?}) timed out", self.method, self.id());
                self.abandon();
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Stop waiting. Only affects this side: the partner may still run the
    /// request, and its response will be dropped when it arrives.
    pub fn cancel(mut self) {
        debug!("Call {} (id: {:?}) cancelled", self.method, self.id());
        self.abandon();
    }

    /// Result if it has already arrived. Yields the result once; later
    /// calls report [`RpcError::Interrupted`].
    pub fn try_result(&mut self) -> Option<RpcResult<R>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result.and_then(|value| decode_result(&self.method, value))),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RpcError::Interrupted)),
        }
    }
}

impl<R: DeserializeOwned> Future for CallHandle<R> {
    type Output = RpcResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            // 完了スロットが捨てられた
            Poll::Ready(Err(_)) => Err(RpcError::Interrupted),
        };
        Poll::Ready(result.and_then(|value| decode_result(&self.method, value)))
    }
}

impl<R> fmt::Debug for CallHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("method", &self.method)
            .field("id", &self.id.get())
            .finish()
    }
}

fn decode_result<R: DeserializeOwned>(method: &str, value: Value) -> RpcResult<R> {
    serde_json::from_value(value)
        .map_err(|e| RpcError::Deserialization(format!("result of {}: {}", method, e)))
}
