//! Correlated request/response session over a [`Transport`].
//!
//! Both ends of a bridge run the same session type: each side may serve
//! handlers and issue calls. Responses are matched to calls by id, so they
//! may arrive in any order. A session closes on the first of: peer end of
//! stream, write failure, child exit, or a local [`RpcSession::close`].
//! Once closed, outstanding calls fail with [`RpcError::ChannelClosed`],
//! the message observer is dropped, and responses are no longer written.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use polystep_types::{InboundMessage, RpcMessage, RpcMethod};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::handlers::{HandlerTable, RpcHandler, raw_handler, typed_handler};
use crate::transport::{Transport, TransportEvent};

/// Default deadline for an outgoing call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback that sees every inbound message before routing.
pub type MessageObserver = Arc<dyn Fn(&Value) + Send + Sync>;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The child process exited.
    Exit(Option<i32>),
    /// The peer closed its end of the stream.
    ChannelClosed,
    /// Writing to or reading from the peer failed.
    Disconnect,
    /// [`RpcSession::close`] or [`RpcSession::shutdown`] was called.
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exit(Some(code)) => write!(f, "exit({code})"),
            CloseReason::Exit(None) => f.write_str("exit"),
            CloseReason::ChannelClosed => f.write_str("close"),
            CloseReason::Disconnect => f.write_str("disconnect"),
            CloseReason::Local => f.write_str("local"),
        }
    }
}

struct PendingEntry {
    method: RpcMethod,
    sender: oneshot::Sender<Result<Value, RpcError>>,
}

struct SessionInner {
    name: String,
    handlers: HandlerTable,
    observer: Mutex<Option<MessageObserver>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    outbound: UnboundedSender<String>,
    closed: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    closed_signal: watch::Sender<bool>,
    next_id: AtomicU64,
    call_timeout: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let tasks = self.tasks.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Builder for [`RpcSession`].
pub struct RpcSessionBuilder {
    name: String,
    call_timeout: Duration,
    handlers: Vec<(RpcMethod, RpcHandler)>,
}

impl RpcSessionBuilder {
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn handler(mut self, method: RpcMethod, handler: RpcHandler) -> Self {
        self.handlers.push((method, handler));
        self
    }

    /// Binds the session to `transport` and starts routing. Must run inside
    /// a Tokio runtime.
    pub fn start(self, transport: Transport) -> RpcSession {
        self.start_with(transport, |_| {})
    }

    /// Like [`RpcSessionBuilder::start`], running `configure` before the
    /// first inbound message is routed. Handlers that need a handle to their
    /// own session are registered here.
    pub fn start_with<F>(self, transport: Transport, configure: F) -> RpcSession
    where
        F: FnOnce(&RpcSession),
    {
        let parts = transport.into_parts();
        let (closed_signal, _) = watch::channel(false);
        let handlers = HandlerTable::default();
        for (method, handler) in self.handlers {
            handlers.insert(method, handler);
        }

        let inner = Arc::new(SessionInner {
            name: self.name,
            handlers,
            observer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            outbound: parts.outbound,
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            closed_signal,
            next_id: AtomicU64::new(1),
            call_timeout: self.call_timeout,
            shutdown: parts.shutdown,
            tasks: Mutex::new(parts.tasks),
        });

        let session = RpcSession { inner };
        configure(&session);
        let router = spawn_router(Arc::downgrade(&session.inner), parts.inbound);
        lock(&session.inner.tasks).push(router);
        debug!(session = %session.inner.name, "RPC session started");
        session
    }
}

/// One end of an RPC bridge. Cloning shares the session.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcSession {
    pub fn builder(name: impl Into<String>) -> RpcSessionBuilder {
        RpcSessionBuilder {
            name: name.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handlers: Vec::new(),
        }
    }

    /// Starts a session with default settings and no handlers.
    pub fn start(name: impl Into<String>, transport: Transport) -> Self {
        Self::builder(name).start(transport)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle that does not keep the session alive, for use inside its own handlers.
    pub fn downgrade(&self) -> WeakRpcSession {
        WeakRpcSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Registers `handler` for `method`, replacing any earlier one.
    pub fn register_handler<F, Fut>(&self, method: RpcMethod, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.inner.handlers.insert(method, raw_handler(handler));
    }

    /// Registers a handler whose arguments and result go through serde.
    pub fn register_typed<I, O, F, Fut>(&self, method: RpcMethod, handler: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
    {
        self.inner.handlers.insert(method, typed_handler(handler));
    }

    pub fn registered_methods(&self) -> Vec<RpcMethod> {
        self.inner.handlers.methods()
    }

    /// Runs the local handler for `method`.
    ///
    /// Works on a closed session too; only the reply to the peer is
    /// suppressed after close.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let handler = method
            .parse::<RpcMethod>()
            .ok()
            .and_then(|method| self.inner.handlers.get(method))
            .ok_or_else(|| RpcError::handler_not_found(method))?;
        handler(args).await
    }

    /// Sends a call and waits for its response or the call timeout.
    pub async fn call(&self, method: RpcMethod, args: Value) -> Result<Value, RpcError> {
        self.start_call(method, args)?.wait().await
    }

    /// Typed convenience over [`RpcSession::call`].
    pub async fn call_typed<I, O>(&self, method: RpcMethod, args: &I) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let value = self.call(method, serde_json::to_value(args)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Writes the request now and returns a handle for the response.
    ///
    /// Requests started in sequence reach the peer in that order, even if
    /// their responses are awaited concurrently.
    pub fn start_call(&self, method: RpcMethod, args: Value) -> Result<PendingCall, RpcError> {
        if self.is_closed() {
            return Err(RpcError::channel_closed(&self.inner.name));
        }
        let sequence = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{sequence}", self.inner.name);
        let line = serde_json::to_string(&RpcMessage::request(id.clone(), method.as_str(), args))?;
        let (sender, receiver) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), PendingEntry { method, sender });
        if self.inner.outbound.send(line).is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(RpcError::channel_closed(&self.inner.name));
        }

        Ok(PendingCall {
            id,
            method,
            receiver,
            timeout: self.inner.call_timeout,
            session: Arc::downgrade(&self.inner),
        })
    }

    /// Sends a request without an id; no response is expected.
    pub fn notify(&self, method: RpcMethod, args: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::channel_closed(&self.inner.name));
        }
        let line = serde_json::to_string(&RpcMessage::notification(method.as_str(), args))?;
        self.inner
            .outbound
            .send(line)
            .map_err(|_| RpcError::channel_closed(&self.inner.name))
    }

    /// Installs the catch-all observer, replacing the previous one.
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return;
        }
        *lock(&self.inner.observer) = Some(Arc::new(observer));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().copied()
    }

    /// Marks the session closed. The transport keeps running.
    pub fn close(&self) {
        close_session(&self.inner, CloseReason::Local);
    }

    /// Closes the session and stops the transport, killing a child process.
    pub fn shutdown(&self) {
        close_session(&self.inner, CloseReason::Local);
        self.inner.shutdown.cancel();
    }

    /// Resolves once the session is closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed_signal.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

#[derive(Clone, Default)]
pub struct WeakRpcSession {
    inner: Weak<SessionInner>,
}

impl WeakRpcSession {
    pub fn upgrade(&self) -> Option<RpcSession> {
        self.inner.upgrade().map(|inner| RpcSession { inner })
    }
}

/// An in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    method: RpcMethod,
    receiver: oneshot::Receiver<Result<Value, RpcError>>,
    timeout: Duration,
    session: Weak<SessionInner>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> RpcMethod {
        self.method
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Waits for the response. A timed-out call is forgotten, so a late
    /// response is dropped.
    pub async fn wait(self) -> Result<Value, RpcError> {
        let PendingCall {
            id,
            method,
            receiver,
            timeout,
            session,
        } = self;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                let name = session.upgrade().map(|session| session.name.clone()).unwrap_or_default();
                Err(RpcError::channel_closed(name))
            }
            Err(_) => {
                if let Some(session) = session.upgrade() {
                    lock(&session.pending).remove(&id);
                }
                warn!(id = %id, method = %method, timeout = ?timeout, "RPC call timed out");
                Err(RpcError::timeout(method.as_str(), timeout))
            }
        }
    }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner").field("name", &self.name).finish()
    }
}

fn spawn_router(session: Weak<SessionInner>, mut inbound: UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            let Some(inner) = session.upgrade() else {
                break;
            };
            match event {
                TransportEvent::Message(raw) => route_message(&inner, raw),
                TransportEvent::Closed => close_from_transport(&inner, CloseReason::ChannelClosed),
                TransportEvent::Disconnected(reason) => {
                    warn!(session = %inner.name, reason = %reason, "RPC transport disconnected");
                    close_from_transport(&inner, CloseReason::Disconnect);
                }
                TransportEvent::Exited(code) => close_from_transport(&inner, CloseReason::Exit(code)),
            }
        }
    })
}

fn route_message(inner: &Arc<SessionInner>, raw: Value) {
    if !inner.closed.load(Ordering::Acquire) {
        let observer = lock(&inner.observer).clone();
        if let Some(observer) = observer {
            observer(&raw);
        }
    }

    match InboundMessage::decode(raw) {
        InboundMessage::Rpc(RpcMessage::RpcRequest { id, method, args }) => {
            let session = RpcSession { inner: Arc::clone(inner) };
            tokio::spawn(async move {
                let result = session.invoke(&method, args).await;
                match id {
                    Some(id) => respond(&session.inner, id, result),
                    None => {
                        if let Err(error) = result {
                            debug!(session = %session.inner.name, method = %method, error = %error, "Notification handler failed");
                        }
                    }
                }
            });
        }
        InboundMessage::Rpc(RpcMessage::RpcResponse { id, result, error }) => {
            let entry = lock(&inner.pending).remove(&id);
            let Some(entry) = entry else {
                debug!(session = %inner.name, id = %id, "Dropping response with no pending call");
                return;
            };
            let outcome = match error {
                Some(message) => Err(RpcError::remote(entry.method.as_str(), message)),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = entry.sender.send(outcome);
        }
        InboundMessage::Other(_) => {}
    }
}

fn respond(inner: &SessionInner, id: String, result: Result<Value, RpcError>) {
    if inner.closed.load(Ordering::Acquire) {
        debug!(session = %inner.name, id = %id, "Session closed, response suppressed");
        return;
    }
    let message = match result {
        Ok(value) => RpcMessage::success(id, value),
        Err(error) => RpcMessage::failure(id, error.to_string()),
    };
    match serde_json::to_string(&message) {
        Ok(line) => {
            let _ = inner.outbound.send(line);
        }
        Err(error) => warn!(session = %inner.name, error = %error, "Failed to encode RPC response"),
    }
}

fn close_from_transport(inner: &SessionInner, reason: CloseReason) {
    close_session(inner, reason);
    inner.shutdown.cancel();
}

fn close_session(inner: &SessionInner, reason: CloseReason) {
    if inner
        .closed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let _ = inner.close_reason.set(reason);
    lock(&inner.observer).take();

    let pending: Vec<PendingEntry> = lock(&inner.pending).drain().map(|(_, entry)| entry).collect();
    for entry in pending {
        let _ = entry.sender.send(Err(RpcError::channel_closed(&inner.name)));
    }
    inner.closed_signal.send_replace(true);
    info!(session = %inner.name, reason = %reason, "RPC session closed");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
