//! The multiplexed call channel over one duplex stream.
//!
//! A `Connection` owns its transport stream exclusively: one demux loop
//! performs every read, and one async-mutexed writer performs every
//! write, so frames never interleave on the wire. Everything else -
//! resolving pending calls, running inbound handlers - happens off the
//! loop as independent units of concurrency.
//!
//! Lifecycle: `Connection::spawn` takes an established stream and starts
//! the demux loop immediately. The connection transitions to closed on
//! explicit [`Connection::close`], on stream fault, or on protocol
//! violation; closed is terminal, and a replacement connection is
//! obtained through the [`Registry`](crate::Registry).

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tether_wire::{FrameReader, FrameWriter, Message, ProtocolError, WireError};

use crate::error::CallError;
use crate::handler::{BoxFuture, DispatchHook, HandlerMap, HandlerResult, HookContext};
use crate::pool::{CancelSlot, ResourcePool};

/// Idle cancellation controllers kept per connection.
const CANCEL_POOL_CAPACITY: usize = 128;

type BoxedReader = FrameReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Completion slot for one outstanding call.
type PendingReply = oneshot::Sender<Result<Value, CallError>>;

/// Local configuration for a connection. There is no negotiation: each
/// side applies its own limits.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Deadline applied to calls that don't set their own.
    pub default_call_timeout: Duration,
    /// Ceiling on inbound frame payloads.
    pub max_frame_len: usize,
    /// Optional extension point composed around inbound dispatch.
    pub hook: Option<Arc<dyn DispatchHook>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_secs(30),
            max_frame_len: tether_wire::DEFAULT_MAX_FRAME_LEN,
            hook: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("default_call_timeout", &self.default_call_timeout)
            .field("max_frame_len", &self.max_frame_len)
            .field("hook", &self.hook.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Per-call options. Unset fields fall back to [`ConnectionConfig`].
#[derive(Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub token: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// Why a connection stopped. Recorded once; later faults are ignored.
#[derive(Debug, Clone)]
enum FaultKind {
    /// Undecodable or oversize traffic; the stream cannot resynchronize.
    Protocol(String),
    /// The stream itself failed, or the peer went away.
    Transport(String),
    /// Explicit local close.
    LocalClose,
}

impl FaultKind {
    fn to_call_error(&self) -> CallError {
        match self {
            FaultKind::Protocol(msg) => CallError::Protocol(msg.clone()),
            FaultKind::Transport(msg) => CallError::ConnectionFault(msg.clone()),
            FaultKind::LocalClose => CallError::ConnectionFault("connection closed".into()),
        }
    }
}

/// A live, multiplexed RPC connection over one byte stream.
///
/// Cheap to share: the runtime hands out `Arc<Connection>` and all
/// operations take `&self`. Both roles use the same type - an initiator
/// obtained from the registry and an acceptor spawned by a host differ
/// only in how their stream was established.
pub struct Connection {
    name: String,
    writer: AsyncMutex<BoxedWriter>,
    /// Outstanding outbound calls: correlation id -> completion slot.
    pending: Mutex<HashMap<u32, PendingReply>>,
    /// Running inbound dispatches: correlation id -> cancellation token.
    inbound: Mutex<HashMap<u32, CancellationToken>>,
    /// Correlation ids are monotonic and never reused for this
    /// connection's lifetime.
    next_id: AtomicU32,
    /// Fires exactly once, when the connection becomes closed.
    shutdown: CancellationToken,
    fault: Mutex<Option<FaultKind>>,
    stream_closed: AtomicBool,
    handlers: Arc<HandlerMap>,
    config: ConnectionConfig,
    cancel_pool: ResourcePool<CancelSlot>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    /// Wrap an established stream and start the demux loop.
    pub fn spawn<S>(
        name: impl Into<String>,
        stream: S,
        handlers: Arc<HandlerMap>,
        config: ConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let reader = FrameReader::with_limit(
            Box::new(r) as Box<dyn AsyncRead + Send + Unpin>,
            config.max_frame_len,
        );
        let writer = FrameWriter::new(Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>);

        let conn = Arc::new(Self {
            name: name.into(),
            writer: AsyncMutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
            fault: Mutex::new(None),
            stream_closed: AtomicBool::new(false),
            handlers,
            config,
            cancel_pool: ResourcePool::new(CANCEL_POOL_CAPACITY, CancelSlot::new),
            on_closed: Mutex::new(None),
        });

        tokio::spawn(conn.clone().run(reader));
        conn
    }

    /// Display name, `<endpoint key>#<role>` by convention.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connection has reached its terminal closed state.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Suspend until the connection is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Register a callback invoked once when the connection closes.
    /// Runs immediately if it already has.
    pub fn on_closed(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut slot = self.on_closed.lock();
            if self.is_closed() {
                true
            } else {
                *slot = Some(Box::new(f));
                return;
            }
        };
        if run_now {
            f();
        }
    }

    /// Issue a call and wait for its outcome.
    ///
    /// Whichever of {response, timeout, caller cancellation, connection
    /// fault} happens first resolves the call. On timeout or
    /// cancellation a Cancel frame is sent best-effort; the call does
    /// not wait for the peer to acknowledge it.
    pub async fn call(
        self: &Arc<Self>,
        endpoint: &str,
        method: &str,
        args: Value,
        opts: CallOptions,
    ) -> Result<Value, CallError> {
        if let Some(kind) = self.fault.lock().clone() {
            return Err(kind.to_call_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let timeout = opts.timeout.unwrap_or(self.config.default_call_timeout);
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let request = Message::Request {
            id,
            endpoint: endpoint.to_owned(),
            method: method.to_owned(),
            args,
            timeout_ms: Some(timeout_ms),
        };

        if let Err(e) = self.send(&request).await {
            self.pending.lock().remove(&id);
            return Err(self.fault_from_protocol(e));
        }

        // A default token never fires; the select then races only the
        // response, the deadline, and the connection fault.
        let caller_token = opts.token.unwrap_or_default();

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(CallError::ConnectionFault("connection closed".into())),
            },
            // The fault transition drains the pending table, but this
            // entry may have been inserted after the drain; observing
            // the shutdown directly keeps such a call from waiting out
            // its timeout on a dead connection.
            _ = self.shutdown.cancelled() => {
                self.pending.lock().remove(&id);
                Err(match self.fault.lock().clone() {
                    Some(kind) => kind.to_call_error(),
                    None => CallError::ConnectionFault("connection closed".into()),
                })
            }
            _ = tokio::time::sleep(timeout) => {
                self.abandon(id);
                Err(CallError::Timeout)
            }
            _ = caller_token.cancelled() => {
                self.abandon(id);
                Err(CallError::Canceled)
            }
        }
    }

    /// Close the connection. Idempotent; safe to race with the demux
    /// loop, which observes the shutdown and exits cleanly.
    pub async fn close(&self) {
        self.fault(FaultKind::LocalClose);
        self.close_stream().await;
    }

    /// Drop the pending entry for an abandoned call and tell the peer,
    /// fire-and-forget.
    fn abandon(self: &Arc<Self>, id: u32) {
        if self.pending.lock().remove(&id).is_none() {
            // The response won the race after all; nothing to cancel.
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.send(&Message::Cancel { id }).await {
                debug!(name = %conn.name, id, error = %e, "cancel frame not sent");
            }
        });
    }

    /// Write one frame. The only lock held across stream I/O.
    ///
    /// The write races the shutdown token: a writer stalled on a peer
    /// that stopped reading lets go as soon as the connection is torn
    /// down, so teardown never waits behind it.
    async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        if self.stream_closed.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            return Err(closed_error());
        }
        tokio::select! {
            result = writer.send(msg) => result,
            _ = self.shutdown.cancelled() => Err(closed_error()),
        }
    }

    /// Record the fault and translate it for the failed sender.
    fn fault_from_protocol(&self, e: ProtocolError) -> CallError {
        let kind = if e.is_transport() {
            FaultKind::Transport(e.to_string())
        } else {
            FaultKind::Protocol(e.to_string())
        };
        self.fault(kind.clone());
        kind.to_call_error()
    }

    /// Transition to closed. First caller wins; the transition fails
    /// every pending call, cancels every running inbound dispatch, and
    /// notifies the closure callback.
    fn fault(&self, kind: FaultKind) {
        {
            let mut slot = self.fault.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(kind.clone());
        }

        match &kind {
            FaultKind::LocalClose => debug!(name = %self.name, "connection closed"),
            FaultKind::Transport(msg) => warn!(name = %self.name, %msg, "connection fault"),
            FaultKind::Protocol(msg) => error!(name = %self.name, %msg, "protocol violation"),
        }

        self.shutdown.cancel();

        let pending: Vec<PendingReply> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(kind.to_call_error()));
        }

        let inbound: Vec<CancellationToken> = {
            let mut map = self.inbound.lock();
            map.drain().map(|(_, token)| token).collect()
        };
        for token in inbound {
            token.cancel();
        }

        if let Some(cb) = self.on_closed.lock().take() {
            cb();
        }
    }

    /// Shut down the write side of the stream, exactly once.
    async fn close_stream(&self) {
        if self.stream_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(name = %self.name, error = %e, "stream shutdown");
        }
    }

    /// The demux loop. The only reader of the stream.
    async fn run(self: Arc<Self>, mut reader: BoxedReader) {
        let fault = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break None,

                frame = reader.recv() => match frame {
                    Ok(Some(msg)) => self.handle_frame(msg),
                    Ok(None) => {
                        break Some(FaultKind::Transport("peer closed the connection".into()));
                    }
                    Err(e) => {
                        break Some(if e.is_transport() {
                            FaultKind::Transport(e.to_string())
                        } else {
                            FaultKind::Protocol(e.to_string())
                        });
                    }
                },
            }
        };

        if let Some(kind) = fault {
            self.fault(kind);
        }
        self.close_stream().await;
    }

    /// Route one inbound frame. Pairing is solely by correlation id,
    /// never arrival order.
    fn handle_frame(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Response { id, result, error } => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            Some(e) => Err(CallError::Remote(e)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        // Already timed out or canceled locally.
                        debug!(name = %self.name, id, "discarding response with no pending call");
                    }
                }
            }
            Message::Cancel { id } => {
                // Remove and fire under one lock: a dispatch that
                // finishes concurrently either beats the remove (and
                // pools a clean slot) or sees its slot spent on return.
                let mut inbound = self.inbound.lock();
                match inbound.remove(&id) {
                    Some(token) => token.cancel(),
                    None => {
                        debug!(name = %self.name, id, "cancel for unknown or finished request");
                    }
                }
            }
            Message::Request {
                id,
                endpoint,
                method,
                args,
                timeout_ms,
            } => {
                self.spawn_dispatch(id, endpoint, method, args, timeout_ms);
            }
        }
    }

    /// Dispatch one inbound request as its own task. A slow or failing
    /// handler never blocks the demux loop or other requests; only the
    /// physical response write is serialized.
    fn spawn_dispatch(
        self: &Arc<Self>,
        id: u32,
        endpoint: String,
        method: String,
        args: Value,
        timeout_ms: Option<u32>,
    ) {
        let slot = self.cancel_pool.rent();
        let token = slot.token().clone();
        self.inbound.lock().insert(id, token.clone());

        let conn = self.clone();
        tokio::spawn(async move {
            let result = conn
                .invoke_handler(&endpoint, method, args, timeout_ms, token)
                .await;

            conn.inbound.lock().remove(&id);
            conn.cancel_pool.give_back(slot);

            let response = match result {
                Ok(value) => Message::Response {
                    id,
                    result: Some(value),
                    error: None,
                },
                Err(e) => Message::Response {
                    id,
                    result: None,
                    error: Some(e),
                },
            };
            if let Err(e) = conn.send(&response).await {
                warn!(name = %conn.name, id, error = %e, "response not sent");
                if e.is_transport() {
                    conn.fault(FaultKind::Transport(e.to_string()));
                }
            }
        });
    }

    /// Resolve the handler, compose the hook, and run the invocation
    /// under its cancellation token and remaining call budget.
    async fn invoke_handler(
        &self,
        endpoint: &str,
        method: String,
        args: Value,
        timeout_ms: Option<u32>,
        token: CancellationToken,
    ) -> HandlerResult {
        let Some(handler) = self.handlers.get(endpoint) else {
            return Err(WireError::new(
                "UnknownEndpoint",
                format!("no handler bound for endpoint `{endpoint}`"),
            ));
        };

        let fut = handler.invoke(method.clone(), args, token.clone());
        let fut = match &self.config.hook {
            Some(hook) => hook.around(
                HookContext {
                    connection: self.name.clone(),
                    endpoint: endpoint.to_owned(),
                    method,
                },
                fut,
            ),
            None => fut,
        };

        run_guarded(fut, timeout_ms.map(|ms| Duration::from_millis(ms.into())), token).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Run a handler future with panic isolation, cancellation, and the
/// call budget the peer sent along. Errors out of here become error
/// Response frames; nothing escapes to the dispatch task.
async fn run_guarded(
    fut: BoxFuture<'static, HandlerResult>,
    budget: Option<Duration>,
    token: CancellationToken,
) -> HandlerResult {
    let work = async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(WireError::new("HandlerPanic", panic_message(&panic))),
        }
    };
    tokio::pin!(work);

    match budget {
        Some(budget) => tokio::select! {
            result = &mut work => result,
            _ = token.cancelled() => Err(WireError::new("Canceled", "call was canceled")),
            _ = tokio::time::sleep(budget) => {
                token.cancel();
                Err(WireError::new("Timeout", "call budget elapsed"))
            }
        },
        None => tokio::select! {
            result = &mut work => result,
            _ = token.cancelled() => Err(WireError::new("Canceled", "call was canceled")),
        },
    }
}

fn closed_error() -> ProtocolError {
    ProtocolError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection closed",
    ))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
