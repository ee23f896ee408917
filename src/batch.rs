//! Client-side batching.
//!
//! A [`Batch`] collects asynchronous calls and notifications and writes them
//! at [`Batch::submit`], one JSON array per target connection. Nothing is
//! written before that; dropping an unsubmitted batch discards it.

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::mem;
use std::sync::{Arc, OnceLock};
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::jsonrpc::types::Params;
use crate::pending::Completion;
use crate::request::{CallHandle, IdSlot, OutboundRequest};

/// One message waiting in a batch
pub(crate) enum BatchEntry {
    Call {
        method: String,
        params: Params,
        meta: Map<String, Value>,
        completion: Completion,
        id: IdSlot,
    },
    Notification {
        method: String,
        params: Params,
        meta: Map<String, Value>,
    },
}

struct Group {
    connection: Arc<Connection>,
    entries: Vec<BatchEntry>,
}

/// Explicit batch scope
#[derive(Default)]
pub struct Batch {
    groups: Vec<Group>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_for(&mut self, connection: &Arc<Connection>) -> &mut Vec<BatchEntry> {
        let index = match self
            .groups
            .iter()
            .position(|group| group.connection.id() == connection.id())
        {
            Some(index) => index,
            None => {
                self.groups.push(Group {
                    connection: connection.clone(),
                    entries: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[index].entries
    }

    fn accept(connection: &Connection, meta: &Map<String, Value>) -> RpcResult<()> {
        if !connection.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }
        connection.core().check_outbound_meta(meta)
    }

    /// Queue an asynchronous call. The returned handle has no id until the
    /// batch is submitted.
    pub fn call_async<R: DeserializeOwned>(
        &mut self,
        connection: &Arc<Connection>,
        request: &OutboundRequest<R>,
        params: impl Into<Params>,
    ) -> RpcResult<CallHandle<R>> {
        let params = request.checked(connection, params.into())?;
        Self::accept(connection, request.meta())?;

        let (completion, receiver) = oneshot::channel();
        let id: IdSlot = Arc::new(OnceLock::new());
        self.entries_for(connection).push(BatchEntry::Call {
            method: request.method().to_string(),
            params,
            meta: request.meta().clone(),
            completion,
            id: id.clone(),
        });
        Ok(CallHandle::new(
            request.method().to_string(),
            id,
            receiver,
            connection.pending_table(),
        ))
    }

    /// Queue an asynchronous call to `method` with no declared shape
    pub fn call_method<R: DeserializeOwned>(
        &mut self,
        connection: &Arc<Connection>,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<CallHandle<R>> {
        self.call_async(connection, &OutboundRequest::<R>::new(method), params)
    }

    pub fn notify<R: DeserializeOwned>(
        &mut self,
        connection: &Arc<Connection>,
        request: &OutboundRequest<R>,
        params: impl Into<Params>,
    ) -> RpcResult<()> {
        let params = request.checked(connection, params.into())?;
        Self::accept(connection, request.meta())?;

        self.entries_for(connection).push(BatchEntry::Notification {
            method: request.method().to_string(),
            params,
            meta: request.meta().clone(),
        });
        Ok(())
    }

    pub fn notify_method(
        &mut self,
        connection: &Arc<Connection>,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<()> {
        self.notify(connection, &OutboundRequest::<Value>::new(method), params)
    }

    /// Run `f` in an inner scope. Its entries join this batch when `f`
    /// returns `Ok` and are discarded when it returns `Err`.
    pub fn nested<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Batch) -> Result<T, E>,
    {
        let mut inner = Batch::new();
        let value = f(&mut inner)?;
        self.merge(inner);
        Ok(value)
    }

    /// Move every entry of `other` into this batch, keeping their order
    pub fn merge(&mut self, mut other: Batch) {
        for group in mem::take(&mut other.groups) {
            self.entries_for(&group.connection).extend(group.entries);
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.groups.iter().map(|group| group.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write everything: one array per connection, in the order the
    /// connections were first used. Returns the first write error; the
    /// remaining connections are still attempted.
    pub async fn submit(mut self) -> RpcResult<()> {
        let groups = mem::take(&mut self.groups);
        let mut first_error = None;

        for group in groups {
            let count = group.entries.len();
            debug!(
                "Submitting batch of {} message(s) to {}",
                count,
                group.connection.name()
            );
            if let Err(e) = group.connection.write_batch(group.entries).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        let mut discarded = 0;
        for group in self.groups.drain(..) {
            for entry in group.entries {
                discarded += 1;
                if let BatchEntry::Call { completion, .. } = entry {
                    let _ = completion.send(Err(RpcError::Cancelled));
                }
            }
        }
        if discarded > 0 {
            debug!("Discarded {} unsent batch message(s)", discarded);
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<(u64, usize)> = self
            .groups
            .iter()
            .map(|group| (group.connection.id(), group.entries.len()))
            .collect();
        f.debug_struct("Batch").field("groups", &groups).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig};
    use serde_json::json;

    fn agent_with_connection() -> (Agent, Arc<Connection>, tokio::io::DuplexStream) {
        let agent = Agent::new(AgentConfig::default());
        let (local, remote) = tokio::io::duplex(4096);
        let connection = agent.connect_stream(local, "batch-test");
        (agent, connection, remote)
    }

    #[tokio::test]
    async fn test_nested_scope_merges_on_ok() {
        let (_agent, connection, _remote) = agent_with_connection();
        let mut batch = Batch::new();

        batch.notify_method(&connection, "first", json!([])).unwrap();
        let handle = batch
            .nested(|inner| inner.call_method::<Value>(&connection, "second", json!([1])))
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(handle.id(), None);
    }

    #[tokio::test]
    async fn test_nested_scope_discards_on_err() {
        let (_agent, connection, _remote) = agent_with_connection();
        let mut batch = Batch::new();

        let mut handle = None;
        let result: RpcResult<()> = batch.nested(|inner| {
            handle = Some(inner.call_method::<Value>(&connection, "dropped", json!([]))?);
            Err(RpcError::Protocol("abort".into()))
        });

        assert!(matches!(result, Err(RpcError::Protocol(_))));
        assert!(batch.is_empty());
        assert!(matches!(handle.unwrap().await, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_batch_cancels_handles() {
        let (_agent, connection, _remote) = agent_with_connection();
        let mut batch = Batch::new();
        let handle = batch.call_method::<Value>(&connection, "never", json!([])).unwrap();
        drop(batch);

        assert!(matches!(handle.await, Err(RpcError::Cancelled)));
        assert_eq!(connection.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_rejects_closed_connection() {
        let (_agent, connection, _remote) = agent_with_connection();
        connection.close().await;

        let mut batch = Batch::new();
        assert!(matches!(
            batch.notify_method(&connection, "late", json!([])),
            Err(RpcError::ConnectionClosed)
        ));
    }
}
