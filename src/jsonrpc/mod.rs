//! JSON-RPC 2.0 wire layer
//!
//! - [`types`]: message envelopes, ids, params, error objects
//! - [`params`]: declared parameter shapes and their validation
//! - [`message`]: decoding and classification of inbound objects
//! - [`codec`]: framing of back-to-back JSON values on a byte stream

pub mod codec;
pub mod message;
pub mod params;
pub mod types;

pub use codec::{CodecError, JsonCodec};
pub use message::{IncomingMessage, MessageKind};
pub use params::{ParamShape, ValueKind};
pub use types::{ErrorCode, ErrorObject, Id, Params, Request, Response};
