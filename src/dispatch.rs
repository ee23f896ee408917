//! Inbound request execution.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error};
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::agent::AgentCore;
use crate::connection::Connection;
use crate::handler::{ExecutionMode, HandlerEntry, RequestContext, KIND_PANIC};
use crate::jsonrpc::message::IncomingMessage;
use crate::jsonrpc::params::ValueKind;
use crate::jsonrpc::types::{kind_name, ErrorCode, ErrorObject, Id, Params, Response};

/// Response to an inbound request, either finished or still running on the
/// worker pool
pub(crate) enum Reply {
    Ready(Response),
    Deferred(BoxFuture<'static, Response>),
}

/// Route one request to its handler. Inline handlers are awaited here, on
/// the read loop; pooled handlers come back as [`Reply::Deferred`].
pub(crate) async fn dispatch_request(
    connection: &Arc<Connection>,
    id: Id,
    message: IncomingMessage,
) -> Reply {
    let core = connection.core().clone();
    let method = message.method.clone().unwrap_or_default();

    let Some(entry) = core.registry.request_handler(&method) else {
        debug!("{}: method not found: {}", connection.name(), method);
        let error = ErrorObject::new(ErrorCode::MethodNotFound, Some(json!({ "method": method })));
        return Reply::Ready(Response::error(Some(id), error));
    };

    let params = match Params::from_value(message.params) {
        Ok(params) => params,
        Err(reason) => return Reply::Ready(invalid_params(id, reason)),
    };

    let signature = core.registry.request_signature(&method);
    if let Some(signature) = &signature {
        if let Err(reason) = signature.params.validate(&params) {
            debug!("{}: rejecting {} params: {}", connection.name(), method, reason);
            return Reply::Ready(invalid_params(id, reason));
        }
    }
    let result_kind = signature.map(|s| s.result).unwrap_or(ValueKind::Any);

    let ctx = RequestContext {
        connection: connection.clone(),
        id,
        method,
        meta: message.meta,
    };

    match entry.mode {
        ExecutionMode::Inline => Reply::Ready(execute(entry, ctx, params, result_kind, core).await),
        ExecutionMode::Pooled => {
            Reply::Deferred(Box::pin(execute(entry, ctx, params, result_kind, core)))
        }
    }
}

fn invalid_params(id: Id, reason: String) -> Response {
    Response::error(
        Some(id),
        ErrorObject::custom(ErrorCode::InvalidParams.code(), reason, None),
    )
}

async fn execute(
    entry: HandlerEntry,
    ctx: RequestContext,
    params: Params,
    result_kind: ValueKind,
    core: Arc<AgentCore>,
) -> Response {
    let id = ctx.id.clone();
    let method = ctx.method.clone();

    let outcome = AssertUnwindSafe(entry.handler.handle(ctx, params))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(result)) if result_kind.matches(&result) => Response::success(id, result),
        Ok(Ok(result)) => {
            error!(
                "Handler for {} returned {} instead of {}",
                method,
                kind_name(&result),
                result_kind.name()
            );
            let error = ErrorObject::custom(
                ErrorCode::InternalError.code(),
                format!("result of {} must be {}", method, result_kind.name()),
                None,
            );
            Response::error(Some(id), error)
        }
        Ok(Err(handler_error)) => {
            debug!("Handler for {} failed: {}", method, handler_error);
            let code = core.error_codes.code_for(&handler_error);
            Response::error(
                Some(id),
                ErrorObject::custom(code, handler_error.message, handler_error.data),
            )
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!("Handler for {} panicked: {}", method, message);
            let code = core.error_codes.code_for_kind(KIND_PANIC);
            Response::error(
                Some(id),
                ErrorObject::custom(code, format!("handler panicked: {}", message), None),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }

    #[test]
    fn test_invalid_params_response() {
        let response = invalid_params(Id::Number(3), "missing required parameter `q`".into());
        let value = response.to_value();
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], -32602);
        assert_eq!(value["error"]["message"], "missing required parameter `q`");
    }
}
