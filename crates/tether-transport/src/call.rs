//! Correlated request/response calls over a single duplex connection

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Duration;
use tether_proto::{CallCodec, CallFrame, CallId, CallOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::handler::CallHandler;
use crate::{DuplexConnection, FrameSink, FrameSource, TransportError, TransportResult};

/// Handle on a call transport
///
/// Cheap to clone; every clone shares the same connection, pending-call table
/// and handler table. One clone drives [`serve`](Self::serve) while any
/// number of others issue [`call`](Self::call)s.
#[derive(Clone)]
pub struct CallTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    next_id: AtomicU64,
    /// Calls awaiting a response (call id -> waiting caller)
    pending: Mutex<HashMap<CallId, oneshot::Sender<CallOutcome>>>,
    handlers: RwLock<HashMap<String, Arc<dyn CallHandler>>>,
    outbound_tx: mpsc::Sender<Bytes>,
    /// Taken by the first `serve`
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    connection_id: OnceLock<String>,
}

impl std::fmt::Debug for CallTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTransport")
            .field("connection_id", &self.inner.label())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn label(&self) -> &str {
        self.connection_id
            .get()
            .map(String::as_str)
            .unwrap_or("unbound")
    }

    /// Mark the transport dead and fail every outstanding call
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        // Dropping the senders resolves each waiting caller with Disconnected
        let drained = std::mem::take(&mut *lock(&self.pending));
        if !drained.is_empty() {
            debug!(
                "[{}] Failing {} outstanding call(s)",
                self.label(),
                drained.len()
            );
        }
    }

    async fn enqueue(&self, frame: Bytes) -> TransportResult<()> {
        tokio::select! {
            result = self.outbound_tx.send(frame) => {
                result.map_err(|_| TransportError::Disconnected)
            }
            _ = self.shutdown.cancelled() => Err(TransportError::Disconnected),
        }
    }
}

/// Removes a pending entry when the caller gives up (timeout or drop)
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl CallTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));

        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                connection_id: OnceLock::new(),
            }),
        }
    }

    /// Bind a handler to a method name, replacing any previous one
    pub fn register_handler(&self, method: impl Into<String>, handler: impl CallHandler) {
        let method = method.into();
        debug!("[{}] Registered handler for {}", self.inner.label(), method);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method, Arc::new(handler));
    }

    /// Issue a call using the configured default timeout
    pub async fn call(&self, method: &str, payload: Bytes) -> TransportResult<Bytes> {
        self.call_with_timeout(method, payload, self.inner.config.call_timeout)
            .await
    }

    /// Issue a call and wait for its correlated response
    ///
    /// Resolves with [`TransportError::Disconnected`] if the connection closes
    /// or the transport is stopped while the call is outstanding.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> TransportResult<Bytes> {
        let inner = &*self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = CallCodec::encode(&CallFrame::Request {
            id,
            method: method.to_string(),
            payload: payload.to_vec(),
        })
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&inner.pending).insert(id, tx);
        let _guard = PendingGuard { inner, id };

        // close() may have drained the table just before our insert
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        trace!(
            "[{}] Call {} -> {} ({} bytes)",
            inner.label(),
            id,
            method,
            payload.len()
        );

        let exchange = async {
            inner.enqueue(frame).await?;
            tokio::select! {
                biased;
                outcome = rx => outcome.map_err(|_| TransportError::Disconnected),
                _ = inner.shutdown.cancelled() => Err(TransportError::Disconnected),
            }
        };

        let outcome = match timeout {
            Some(deadline) => tokio::time::timeout(deadline, exchange)
                .await
                .map_err(|_| TransportError::Timeout(deadline))??,
            None => exchange.await?,
        };

        match outcome {
            CallOutcome::Ok(data) => Ok(Bytes::from(data)),
            CallOutcome::Err(message) => Err(TransportError::Remote(message)),
        }
    }

    /// Issue a call whose argument and result are bincode values
    pub async fn call_typed<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> TransportResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = CallCodec::encode_value(request)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        let reply = self.call_with_timeout(method, payload, timeout).await?;
        CallCodec::decode_value(&reply).map_err(|e| TransportError::ProtocolError(e.to_string()))
    }

    /// Drive the connection until it closes or [`stop`](Self::stop) is called
    ///
    /// Incoming requests are dispatched to registered handlers, incoming
    /// responses to the callers waiting on them. When the loop ends every
    /// outstanding call fails with [`TransportError::Disconnected`].
    pub async fn serve<C: DuplexConnection>(&self, connection: C) -> TransportResult<()> {
        let outbound_rx = lock(&self.inner.outbound_rx)
            .take()
            .ok_or(TransportError::AlreadyServing)?;

        let connection_id = connection.connection_id();
        let _ = self.inner.connection_id.set(connection_id.clone());
        let (sink, mut source) = connection.split();

        debug!("[{}] Call transport serving", connection_id);

        let writer = tokio::spawn(writer_task(
            sink,
            outbound_rx,
            self.inner.shutdown.clone(),
            connection_id.clone(),
        ));

        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    debug!("[{}] Call transport stopped", connection_id);
                    break;
                }
                frame = source.recv_frame() => match frame {
                    Ok(Some(data)) => self.dispatch(&data),
                    Ok(None) => {
                        debug!("[{}] Connection closed by peer", connection_id);
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] Connection read error: {}", connection_id, e);
                        result = Err(e);
                        break;
                    }
                },
            }
        }

        self.inner.close();
        if let Err(e) = writer.await {
            warn!("[{}] Writer task failed: {}", connection_id, e);
        }

        debug!("[{}] Call transport finished", connection_id);
        result
    }

    fn dispatch(&self, data: &[u8]) {
        let frame = match CallCodec::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Dropping undecodable frame: {}", self.inner.label(), e);
                return;
            }
        };

        match frame {
            CallFrame::Response { id, outcome } => {
                let waiter = lock(&self.inner.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        // The caller may have timed out in the meantime
                        let _ = tx.send(outcome);
                    }
                    None => debug!(
                        "[{}] No pending call for response id={}",
                        self.inner.label(),
                        id
                    ),
                }
            }
            CallFrame::Request {
                id,
                method,
                payload,
            } => {
                let handler = self
                    .inner
                    .handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&method)
                    .cloned();
                let inner = self.inner.clone();

                tokio::spawn(async move {
                    trace!("[{}] Handling {} (id={})", inner.label(), method, id);

                    let outcome = match handler {
                        Some(handler) => tokio::select! {
                            result = handler.handle(Bytes::from(payload)) => match result {
                                Ok(reply) => CallOutcome::Ok(reply.to_vec()),
                                Err(e) => CallOutcome::Err(e.to_string()),
                            },
                            _ = inner.shutdown.cancelled() => return,
                        },
                        None => {
                            warn!("[{}] Call for unknown method {}", inner.label(), method);
                            CallOutcome::Err(format!("unknown method: {}", method))
                        }
                    };

                    match CallCodec::encode(&CallFrame::Response { id, outcome }) {
                        Ok(frame) => {
                            if inner.enqueue(frame).await.is_err() {
                                debug!(
                                    "[{}] Connection gone before response id={}",
                                    inner.label(),
                                    id
                                );
                            }
                        }
                        Err(e) => {
                            warn!("[{}] Failed to encode response: {}", inner.label(), e);
                            let fallback = CallFrame::Response {
                                id,
                                outcome: CallOutcome::Err(e.to_string()),
                            };
                            if let Ok(frame) = CallCodec::encode(&fallback) {
                                let _ = inner.enqueue(frame).await;
                            }
                        }
                    }
                });
            }
        }
    }

    /// Stop serving and fail all outstanding calls
    pub fn stop(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the transport has stopped for any reason
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Shared cancellation signal; cancelling it stops the transport
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.inner.connection_id.get().map(String::as_str)
    }
}

/// Writer task - the single owner of the sending half
async fn writer_task<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    connection_id: String,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send_frame(frame).await {
                        warn!("[{}] Connection write error: {}", connection_id, e);
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // A failed writer takes the whole transport down with it
    shutdown.cancel();
    if let Err(e) = sink.close().await {
        debug!("[{}] Error closing connection: {}", connection_id, e);
    }
    debug!("[{}] Writer task ended", connection_id);
}
