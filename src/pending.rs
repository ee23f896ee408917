//! Per-connection table of calls awaiting a response.

use log::{debug, trace};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;

use crate::error::{RemoteError, RpcError, RpcResult};
use crate::jsonrpc::types::{ErrorObject, Id};

/// Completion slot of an in-flight call
pub(crate) type Completion = oneshot::Sender<RpcResult<Value>>;

struct PendingCall {
    method: String,
    completion: Completion,
    issued_at: Instant,
}

#[derive(Default)]
struct State {
    calls: HashMap<Id, PendingCall>,
    closed: bool,
}

/// What happened to a response handed to [`PendingCalls::complete`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The caller gave up (cancelled or timed out) before the response came
    Abandoned,
    UnknownId,
}

/// Correlation map from call id to the caller waiting on it.
///
/// Every call leaves the table exactly once: by a matching response, by
/// [`PendingCalls::remove`] when its write failed or its caller gave up, or
/// by the sweep in [`PendingCalls::close_all`]. Once closed the table
/// refuses new entries.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an in-flight call. Ids come from the agent-wide counter and
    /// are never reused. When the table is already closed the completion is
    /// handed back so the caller can fail it.
    pub(crate) fn register(
        &self,
        id: Id,
        method: &str,
        completion: Completion,
    ) -> Result<(), Completion> {
        let mut state = self.lock();
        if state.closed {
            return Err(completion);
        }
        trace!("Registered call {} ({})", id, method);
        state.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                completion,
                issued_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Complete the call with `id` using a response outcome
    pub fn complete(&self, id: &Id, outcome: Result<Value, ErrorObject>) -> Delivery {
        let Some(call) = self.lock().calls.remove(id) else {
            return Delivery::UnknownId;
        };

        debug!(
            "Response for {} (id: {}) after {:?}",
            call.method,
            id,
            call.issued_at.elapsed()
        );

        let result = outcome.map_err(|error| {
            RpcError::Remote(RemoteError::from_object(
                error,
                Some(call.method.clone()),
                Some(id.clone()),
            ))
        });
        Self::deliver(call, result)
    }

    /// Fail the call with `id` with a local error
    pub fn fail(&self, id: &Id, error: RpcError) -> Delivery {
        match self.lock().calls.remove(id) {
            Some(call) => Self::deliver(call, Err(error)),
            None => Delivery::UnknownId,
        }
    }

    fn deliver(call: PendingCall, result: RpcResult<Value>) -> Delivery {
        match call.completion.send(result) {
            Ok(()) => Delivery::Delivered,
            Err(_) => {
                debug!("Ignoring late response for abandoned call {}", call.method);
                Delivery::Abandoned
            }
        }
    }

    /// Drop an entry without completing it. Used when the write failed and
    /// when the caller cancelled or timed out.
    pub(crate) fn remove(&self, id: &Id) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    /// Close the table and fail everything still waiting. Returns the number
    /// of calls that were failed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(Id, PendingCall)> = {
            let mut state = self.lock();
            state.closed = true;
            state.calls.drain().collect()
        };

        let count = drained.len();
        for (id, call) in drained {
            trace!("Failing call {} ({}) on close", id, call.method);
            let _ = call.completion.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.lock().calls.contains_key(id)
    }

    pub fn method_of(&self, id: &Id) -> Option<String> {
        self.lock().calls.get(id).map(|call| call.method.clone())
    }
}
