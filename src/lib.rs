//! tether - bidirectional JSON-RPC 2.0 agents over byte streams.
//!
//! An [`Agent`] serves any number of [`Connection`]s. Either side of a
//! connection may send requests and notifications at any time; calls can be
//! awaited directly, held as [`CallHandle`]s, or collected into a [`Batch`].

pub mod agent;
pub mod batch;
pub mod connection;
pub mod error;
pub mod handler;
pub mod jsonrpc;
pub mod pending;
pub mod pool;
pub mod request;
pub mod transport;

mod dispatch;

// 公開API
pub use agent::{Agent, AgentBuilder, AgentConfig};
pub use batch::Batch;
pub use connection::{Connection, DisconnectHook, DisconnectReason};
pub use error::{RemoteError, RemoteErrorKind, RpcError, RpcResult};
pub use handler::{
    handler_fn, typed_handler, ErrorCodeMap, ExecutionMode, HandlerError, HandlerRegistry,
    NotificationInducer, RequestContext, RequestHandler,
};
pub use jsonrpc::{ErrorCode, ErrorObject, Id, ParamShape, Params, ValueKind};
pub use request::{CallHandle, OutboundRequest};
pub use transport::ChildConnection;
