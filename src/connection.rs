//! One live stream pair to one partner.
//!
//! A connection runs two tasks for its whole lifetime: the read loop, which
//! decodes and routes every inbound value, and the notification task, which
//! drains the bounded notification queue one entry at a time. Any task may
//! write; writers take turns on a single mutex so messages never interleave.

use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentCore;
use crate::batch::BatchEntry;
use crate::dispatch::{self, Reply};
use crate::error::{RpcError, RpcResult};
use crate::handler::InducedNotification;
use crate::jsonrpc::codec::JsonCodec;
use crate::jsonrpc::message::{DecodeContext, IncomingMessage, MessageKind};
use crate::jsonrpc::types::{kind_name, ErrorCode, ErrorObject, Id, Params, Request, Response};
use crate::pending::{Delivery, PendingCalls};
use crate::request::{CallHandle, OutboundRequest};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FrameWriter = FramedWrite<BoxedWriter, JsonCodec>;

/// How long disconnect waits for an in-progress write before giving up on
/// closing the writer cleanly
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a connection went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally (`close()` or agent shutdown)
    Closed,
    /// The partner ended the stream
    EndOfStream,
    ReadFailed(String),
    /// The partner broke the protocol
    Protocol(String),
    WriteFailed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed locally"),
            DisconnectReason::EndOfStream => f.write_str("end of stream"),
            DisconnectReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            DisconnectReason::Protocol(e) => write!(f, "protocol violation: {}", e),
            DisconnectReason::WriteFailed(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Called once per connection after it has gone down
pub type DisconnectHook = Arc<dyn Fn(&Connection, &DisconnectReason) + Send + Sync>;

/// Notification queue entry; `Shutdown` stops the notification task
enum QueueEntry {
    Deliver(InducedNotification),
    Shutdown,
}

pub struct Connection {
    id: u64,
    name: String,
    core: Arc<AgentCore>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    connected: AtomicBool,
    pending: Arc<PendingCalls>,
    notifications: mpsc::Sender<QueueEntry>,
    /// Stops the read loop
    shutdown: CancellationToken,
    /// Fires once disconnect has finished
    closed: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

impl Connection {
    /// Wrap a stream pair and start its read loop and notification task
    pub(crate) fn open(
        core: Arc<AgentCore>,
        name: String,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Arc<Self> {
        let id = core.next_connection_id();
        let codec = JsonCodec::with_max_message_size(core.config.max_message_size);
        let capacity = core.config.notification_queue_capacity.max(1);
        let (notifications, queue) = mpsc::channel(capacity);

        let connection = Arc::new(Connection {
            id,
            name,
            core: core.clone(),
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, codec.clone()))),
            connected: AtomicBool::new(true),
            pending: Arc::new(PendingCalls::new()),
            notifications,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
        });

        core.track_connection(connection.clone());

        tokio::spawn(connection.clone().notification_loop(queue));
        tokio::spawn(
            connection
                .clone()
                .read_loop(FramedRead::new(reader, codec)),
        );

        info!("Connection {} ({}) established", connection.name, id);
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Lets a call handle drop its own entry when the caller gives up
    pub(crate) fn pending_table(&self) -> Weak<PendingCalls> {
        Arc::downgrade(&self.pending)
    }

    /// Why the connection went down, once it has
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the connection has been fully torn down
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.disconnect(DisconnectReason::Closed).await
    }

    pub(crate) fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    /// Ask the read loop to stop without waiting for it
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Synchronous call: send and wait for the result
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<R> {
        OutboundRequest::<R>::new(method).call(self, params).await
    }

    /// Asynchronous call: send and return a handle to the eventual result
    pub async fn call_async<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Into<Params>,
    ) -> RpcResult<CallHandle<R>> {
        OutboundRequest::<R>::new(method).call_async(self, params).await
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: &str, params: impl Into<Params>) -> RpcResult<()> {
        OutboundRequest::<Value>::new(method).notify(self, params).await
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    /// Register and send one request. The call is in the pending table
    /// before its first byte is written.
    pub(crate) async fn start_call(
        &self,
        method: &str,
        params: Params,
        meta: &Map<String, Value>,
    ) -> RpcResult<(Id, oneshot::Receiver<RpcResult<Value>>)> {
        self.core.check_outbound_meta(meta)?;

        let id = self.core.next_call_id();
        let (completion, receiver) = oneshot::channel();
        if self.pending.register(id.clone(), method, completion).is_err() {
            return Err(RpcError::ConnectionClosed);
        }

        let request = Request::new(Some(id.clone()), method, params).with_meta(meta.clone());
        debug!("{} -> request {} (id: {})", self.name, method, id);

        if let Err(e) = self.write_value(request.to_value()).await {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok((id, receiver))
    }

    pub(crate) async fn send_notification(
        &self,
        method: &str,
        params: Params,
        meta: &Map<String, Value>,
    ) -> RpcResult<()> {
        self.core.check_outbound_meta(meta)?;
        let notification = Request::new(None, method, params).with_meta(meta.clone());
        debug!("{} -> notification {}", self.name, method);
        self.write_value(notification.to_value()).await
    }

    /// Send accumulated batch entries as one JSON array. Ids are assigned
    /// and registered while the array is built.
    pub(crate) async fn write_batch(&self, entries: Vec<BatchEntry>) -> RpcResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut elements = Vec::with_capacity(entries.len());
        let mut registered = Vec::new();

        for entry in entries {
            match entry {
                BatchEntry::Notification {
                    method,
                    params,
                    meta,
                } => {
                    elements.push(Request::new(None, method, params).with_meta(meta).to_value());
                }
                BatchEntry::Call {
                    method,
                    params,
                    meta,
                    completion,
                    id: slot,
                } => {
                    let id = self.core.next_call_id();
                    let _ = slot.set(id.clone());
                    if let Err(completion) = self.pending.register(id.clone(), &method, completion) {
                        let _ = completion.send(Err(RpcError::ConnectionClosed));
                        continue;
                    }
                    registered.push(id.clone());
                    elements.push(
                        Request::new(Some(id), method, params)
                            .with_meta(meta)
                            .to_value(),
                    );
                }
            }
        }

        if elements.is_empty() {
            return Err(RpcError::ConnectionClosed);
        }

        debug!("{} -> batch of {} message(s)", self.name, elements.len());
        if let Err(e) = self.write_value(Value::Array(elements)).await {
            for id in registered {
                self.pending
                    .fail(&id, RpcError::Serialization(format!("batch not sent: {}", e)));
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn write_response(&self, response: Response) {
        let id = response.id.clone();
        if let Err(e) = self.write_value(response.to_value()).await {
            debug!(
                "{}: dropping response (id: {:?}): {}",
                self.name, id, e
            );
        }
    }

    /// Write one top-level value and flush it
    pub(crate) async fn write_value(&self, value: Value) -> RpcResult<()> {
        let result = {
            let mut writer = self.writer.lock().await;
            let sink = match writer.as_mut() {
                Some(sink) if self.is_connected() => sink,
                _ => return Err(RpcError::ConnectionClosed),
            };
            trace!("{} -> {}", self.name, value);
            sink.send(value).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = RpcError::from(e);
                if let RpcError::Io(io) = &error {
                    error!("{}: write failed: {}", self.name, io);
                    self.disconnect(DisconnectReason::WriteFailed(io.to_string()))
                        .await;
                }
                Err(error)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Read loop
    // ---------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>, mut frames: FramedRead<BoxedReader, JsonCodec>) {
        debug!("{}: read loop started", self.name);
        let mut ctx = DecodeContext::default();

        let reason = loop {
            ctx.reset();

            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break DisconnectReason::Closed,
                frame = frames.next() => frame,
            };

            let value = match frame {
                None => {
                    debug!("{}: EOF reached, terminating read loop", self.name);
                    break DisconnectReason::EndOfStream;
                }
                Some(Err(e)) => {
                    error!("{}: read failed: {}", self.name, e);
                    break DisconnectReason::ReadFailed(e.to_string());
                }
                Some(Ok(value)) => value,
            };

            trace!("{} <- {}", self.name, value);

            if let Err(reason) = self.process(value, &mut ctx).await {
                break reason;
            }
        };

        drop(frames);
        self.disconnect(reason).await;
        debug!("{}: read loop stopped", self.name);
    }

    async fn process(
        self: &Arc<Self>,
        value: Value,
        ctx: &mut DecodeContext,
    ) -> Result<(), DisconnectReason> {
        match value {
            Value::Object(object) => {
                if let Some(reply) = self.handle_object(object, ctx).await? {
                    self.send_reply(reply).await;
                }
            }
            Value::Array(items) => self.handle_batch(items, ctx).await?,
            other => {
                warn!(
                    "{}: discarding top-level {} ({})",
                    self.name,
                    kind_name(&other),
                    ctx.describe()
                );
            }
        }
        Ok(())
    }

    async fn handle_object(
        self: &Arc<Self>,
        object: Map<String, Value>,
        ctx: &mut DecodeContext,
    ) -> Result<Option<Reply>, DisconnectReason> {
        let parsed = {
            let allowed = self.core.inbound_meta();
            IncomingMessage::parse(object, &allowed)
        };
        let message = parsed.map_err(|violation| {
            error!("{}: {} ({})", self.name, violation, ctx.describe());
            DisconnectReason::Protocol(violation.to_string())
        })?;
        ctx.record(&message);

        match message.kind() {
            MessageKind::Request(id) => {
                trace!("{}: request {}", self.name, ctx.describe());
                Ok(Some(dispatch::dispatch_request(self, id, message).await))
            }
            MessageKind::Notification => {
                self.enqueue_notification(message, ctx).await?;
                Ok(None)
            }
            MessageKind::Response(Some(id)) => {
                self.deliver_response(id, message);
                Ok(None)
            }
            MessageKind::Response(None) => {
                warn!(
                    "{}: uncorrelated error response: {:?}",
                    self.name, message.error
                );
                Ok(None)
            }
            MessageKind::Invalid { id, reason } => Ok(self.reject_invalid(&message, id, reason, ctx)),
        }
    }

    fn deliver_response(&self, id: Id, message: IncomingMessage) {
        match self.pending.complete(&id, message.into_outcome()) {
            Delivery::Delivered => {}
            Delivery::Abandoned => debug!("{}: late response for id {} ignored", self.name, id),
            // キャンセル・タイムアウト済みの呼び出しもここに来る
            Delivery::UnknownId => debug!("{}: no call waiting on response id {}", self.name, id),
        }
    }

    fn reject_invalid(
        &self,
        message: &IncomingMessage,
        id: Option<Id>,
        reason: String,
        ctx: &DecodeContext,
    ) -> Option<Reply> {
        warn!("{}: invalid message {}: {}", self.name, ctx.describe(), reason);

        if message.is_response_like() {
            if let Some(id) = id {
                self.pending.fail(&id, RpcError::Protocol(reason));
            }
            return None;
        }

        id.map(|id| {
            Reply::Ready(Response::error(
                Some(id),
                ErrorObject::custom(ErrorCode::InvalidRequest.code(), reason, None),
            ))
        })
    }

    async fn enqueue_notification(
        &self,
        message: IncomingMessage,
        ctx: &DecodeContext,
    ) -> Result<(), DisconnectReason> {
        let method = message.method.clone().unwrap_or_default();

        let Some(inducer) = self.core.registry.notification_inducer(&method) else {
            debug!("{}: no inducer for notification {}", self.name, method);
            return Ok(());
        };

        let notification = match inducer.induce(&method, message.params) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("{}: dropping notification {}: {}", self.name, ctx.describe(), e);
                return Ok(());
            }
        };

        // キューが満杯の場合はここで待つ（意図的なバックプレッシャー）
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(DisconnectReason::Closed),
            sent = self.notifications.send(QueueEntry::Deliver(notification)) => {
                sent.map_err(|_| DisconnectReason::Protocol("notification queue closed".to_string()))
            }
        }
    }

    async fn handle_batch(
        self: &Arc<Self>,
        items: Vec<Value>,
        ctx: &mut DecodeContext,
    ) -> Result<(), DisconnectReason> {
        if items.is_empty() {
            warn!("{}: empty batch ({})", self.name, ctx.describe());
            let error = ErrorObject::custom(ErrorCode::InvalidRequest.code(), "empty batch", None);
            self.write_response(Response::error(None, error)).await;
            return Ok(());
        }

        let mut replies = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            ctx.enter_batch_element(index);
            match item {
                Value::Object(object) => {
                    if let Some(reply) = self.handle_object(object, ctx).await? {
                        replies.push(reply);
                    }
                }
                other => {
                    let error = ErrorObject::custom(
                        ErrorCode::InvalidRequest.code(),
                        format!("batch element must be an object, got {}", kind_name(&other)),
                        None,
                    );
                    replies.push(Reply::Ready(Response::error(None, error)));
                }
            }
        }

        if replies.is_empty() {
            return Ok(());
        }

        if replies.iter().all(|reply| matches!(reply, Reply::Ready(_))) {
            let responses = replies
                .into_iter()
                .filter_map(|reply| match reply {
                    Reply::Ready(response) => Some(response.to_value()),
                    Reply::Deferred(_) => None,
                })
                .collect();
            if let Err(e) = self.write_value(Value::Array(responses)).await {
                debug!("{}: dropping batch response: {}", self.name, e);
            }
            return Ok(());
        }

        // プールで実行中のハンドラーを待ってからまとめて返す
        let jobs: Vec<BatchJob> = replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Ready(response) => BatchJob::Done(response),
                Reply::Deferred(job) => BatchJob::Running(self.core.pool.spawn(job)),
            })
            .collect();

        let connection = self.clone();
        tokio::spawn(async move {
            let mut responses = Vec::with_capacity(jobs.len());
            for job in jobs {
                match job {
                    BatchJob::Done(response) => responses.push(response.to_value()),
                    BatchJob::Running(handle) => match handle.await {
                        Ok(response) => responses.push(response.to_value()),
                        Err(e) => error!("{}: batch job failed: {}", connection.name, e),
                    },
                }
            }
            if let Err(e) = connection.write_value(Value::Array(responses)).await {
                debug!("{}: dropping batch response: {}", connection.name, e);
            }
        });

        Ok(())
    }

    async fn send_reply(self: &Arc<Self>, reply: Reply) {
        match reply {
            Reply::Ready(response) => self.write_response(response).await,
            Reply::Deferred(job) => {
                let connection = self.clone();
                self.core.pool.spawn(async move {
                    let response = job.await;
                    connection.write_response(response).await;
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Notification task
    // ---------------------------------------------------------------------

    async fn notification_loop(self: Arc<Self>, mut queue: mpsc::Receiver<QueueEntry>) {
        debug!("{}: notification task started", self.name);

        while let Some(entry) = queue.recv().await {
            let notification = match entry {
                QueueEntry::Shutdown => break,
                QueueEntry::Deliver(notification) => notification,
            };

            let method = notification.method().to_string();
            trace!("{}: delivering notification {}", self.name, method);

            let delivered = AssertUnwindSafe(notification.deliver(self.clone()))
                .catch_unwind()
                .await;
            if delivered.is_err() {
                error!(
                    "{}: notification handler for {} panicked",
                    self.name, method
                );
            }
        }

        debug!("{}: notification task stopped", self.name);
    }

    fn enqueue_shutdown(&self) {
        match self.notifications.try_send(QueueEntry::Shutdown) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let notifications = self.notifications.clone();
                tokio::spawn(async move {
                    let _ = notifications.send(entry).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ---------------------------------------------------------------------
    // Disconnect
    // ---------------------------------------------------------------------

    pub(crate) async fn disconnect(&self, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        match &reason {
            DisconnectReason::Closed | DisconnectReason::EndOfStream => {
                info!("Connection {} ({}) closed: {}", self.name, self.id, reason)
            }
            _ => warn!("Connection {} ({}) lost: {}", self.name, self.id, reason),
        }

        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        self.shutdown.cancel();

        let failed = self.pending.close_all();
        if failed > 0 {
            debug!("{}: failed {} pending call(s)", self.name, failed);
        }

        match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut sink) = writer.take() {
                    if let Err(e) = sink.close().await {
                        debug!("{}: error closing writer: {}", self.name, e);
                    }
                }
            }
            Err(_) => warn!("{}: writer busy, not closed cleanly", self.name),
        }

        self.enqueue_shutdown();
        self.core.forget_connection(self.id);

        if let Some(hook) = &self.core.disconnect_hook {
            hook(self, &reason);
        }

        self.closed.cancel();
    }
}

enum BatchJob {
    Done(Response),
    Running(JoinHandle<Response>),
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish()
    }
}
