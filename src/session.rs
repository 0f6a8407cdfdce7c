// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 framed session over the line-delimited wire shape used by
//! Electrum servers (`server.version`, `blockchain.headers.subscribe`,
//! `blockchain.block.header(s)`): request/response multiplexing bounded
//! by a counting semaphore, plus a subscription cache that fans out
//! server notifications to every interested queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn};

use crate::error::{GracefulDisconnect, InterfaceError, InterfaceResult, ProtocolError};

/// Canonical cache/fan-out key for a subscription: the method name plus a
/// deterministic encoding of its parameters. Stable because every
/// subscribable method on this wire protocol takes a JSON array, never an
/// object, as `params` — so `serde_json::to_string` over the array is
/// already order-independent of anything but argument position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(method: &str, params: &[Value]) -> Self {
        let encoded = serde_json::to_string(params).unwrap_or_default();
        SubscriptionKey(format!("{method}{encoded}"))
    }
}

struct SubscriptionState {
    cached: Option<Value>,
    queues: Vec<mpsc::UnboundedSender<Value>>,
}

/// One side of a notification subscription. `recv()` yields the cached
/// value immediately (if any), then every later notification for this key
/// in arrival order.
pub struct SubscriptionQueue {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl SubscriptionQueue {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

type Transport = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

enum OutgoingLine {
    Line(String),
}

/// Why the reader task's loop ended, so the pending-request sweep below
/// can pick the right error without `InterfaceError` needing to be `Clone`.
enum ReaderTermination {
    Closed,
    FrameTooLarge(usize),
}

/// A live JSON-RPC session over a framed line-delimited transport.
///
/// The reader task owns the socket exclusively; all outbound writes are
/// funneled through an mpsc channel so `send_request`/`subscribe` never
/// need direct access to the sink. This mirrors the "session loop is
/// non-reentrant" design note: consumer code never touches the wire
/// directly, only via queues and oneshots.
pub struct NotificationSession {
    next_id: AtomicU64,
    pending: Arc<Mutex<BTreeMap<u64, oneshot::Sender<InterfaceResult<Value>>>>>,
    subscriptions: Arc<Mutex<HashMap<SubscriptionKey, SubscriptionState>>>,
    semaphore: Arc<Semaphore>,
    outgoing: mpsc::UnboundedSender<OutgoingLine>,
    reader_handle: tokio::task::JoinHandle<()>,
    /// Non-owning back-reference for logging/timeout configuration only.
    /// The session never extends the interface's lifetime via this field.
    peer_label: String,
}

impl NotificationSession {
    /// Wraps `transport` in a line-delimited codec and spawns the reader
    /// task. `max_in_flight` bounds concurrently outstanding requests;
    /// `max_frame_size` rejects any inbound line longer than this as a
    /// protocol error (20 MiB by default, to accommodate AuxPoW-sized
    /// header chunks); `peer_label` is used only in log lines.
    pub fn new(transport: Transport, max_in_flight: usize, max_frame_size: usize, peer_label: String) -> Self {
        let framed = Framed::new(transport, LinesCodec::new_with_max_length(max_frame_size));
        let (mut sink, mut stream) = framed.split();

        let pending = Arc::new(Mutex::new(BTreeMap::new()));
        let subscriptions: Arc<Mutex<HashMap<SubscriptionKey, SubscriptionState>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutgoingLine>();

        tokio::spawn(async move {
            while let Some(OutgoingLine::Line(line)) = outgoing_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let pending_for_reader = pending.clone();
        let subscriptions_for_reader = subscriptions.clone();
        let label_for_reader = peer_label.clone();
        let reader_handle = tokio::spawn(async move {
            let mut termination = ReaderTermination::Closed;
            while let Some(next) = stream.next().await {
                let line = match next {
                    Ok(line) => line,
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        warn!(peer = %label_for_reader, max = max_frame_size, "frame exceeded maximum size");
                        termination = ReaderTermination::FrameTooLarge(max_frame_size);
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %label_for_reader, error = %e, "transport closed");
                        break;
                    }
                };
                if let Err(e) = dispatch_incoming(
                    &line,
                    &pending_for_reader,
                    &subscriptions_for_reader,
                    &label_for_reader,
                ) {
                    warn!(peer = %label_for_reader, error = %e, "dropping malformed/unexpected message");
                }
            }
            // Wake every pending request once the reader loop ends, so
            // nobody awaits forever. A frame-too-large termination gets a
            // protocol error; anything else is treated as a graceful close.
            let mut pending = pending_for_reader.lock();
            for (_, tx) in std::mem::take(&mut *pending) {
                let err = match termination {
                    ReaderTermination::Closed => {
                        InterfaceError::GracefulDisconnect(GracefulDisconnect::ServerClosed)
                    }
                    ReaderTermination::FrameTooLarge(max) => {
                        InterfaceError::Protocol(ProtocolError::FrameTooLarge { max })
                    }
                };
                let _ = tx.send(Err(err));
            }
        });

        Self {
            next_id: AtomicU64::new(1),
            pending,
            subscriptions,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            outgoing: outgoing_tx,
            reader_handle,
            peer_label,
        }
    }

    /// Sends `method(params)` and awaits its reply. The deadline starts
    /// only once the permit is acquired and the line is on the wire, not
    /// while waiting for a free slot in the in-flight semaphore.
    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> InterfaceResult<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| InterfaceError::Internal("semaphore closed".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let line = serde_json::to_string(&request)
            .map_err(|e| InterfaceError::Internal(e.to_string()))?;

        trace!(peer = %self.peer_label, %method, "-> request");
        if self.outgoing.send(OutgoingLine::Line(line)).is_err() {
            self.pending.lock().remove(&id);
            return Err(InterfaceError::GracefulDisconnect(
                GracefulDisconnect::ServerClosed,
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InterfaceError::GracefulDisconnect(
                GracefulDisconnect::ServerClosed,
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(InterfaceError::GracefulDisconnect(
                    GracefulDisconnect::RequestTimedOut,
                ))
            }
        }
    }

    /// Subscribes to `method(params)`. If already cached, the queue
    /// receives the cached value immediately without a round trip;
    /// otherwise one `send_request` populates the cache for every current
    /// and future subscriber under this key.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> InterfaceResult<SubscriptionQueue> {
        let key = SubscriptionKey::new(method, &params);
        let (tx, rx) = mpsc::unbounded_channel();

        let cached = {
            let mut subs = self.subscriptions.lock();
            let entry = subs.entry(key.clone()).or_insert_with(|| SubscriptionState {
                cached: None,
                queues: Vec::new(),
            });
            entry.queues.push(tx.clone());
            entry.cached.clone()
        };

        if let Some(value) = cached {
            let _ = tx.send(value);
            return Ok(SubscriptionQueue { rx });
        }

        let result = self.send_request(method, params, timeout).await?;
        {
            let mut subs = self.subscriptions.lock();
            if let Some(entry) = subs.get_mut(&key) {
                entry.cached = Some(result.clone());
            }
        }
        let _ = tx.send(result);
        Ok(SubscriptionQueue { rx })
    }

    /// Drops this consumer's local queue reference. Subscriptions are not
    /// cancellable server-side; this only stops local delivery — the
    /// caller's `queue` is consumed, and any senders whose receiver has
    /// since been dropped are pruned from the fan-out list.
    pub fn unsubscribe(&self, method: &str, params: &[Value], queue: SubscriptionQueue) {
        drop(queue);
        let key = SubscriptionKey::new(method, params);
        let mut subs = self.subscriptions.lock();
        if let Some(entry) = subs.get_mut(&key) {
            entry.queues.retain(|q| !q.is_closed());
        }
    }

    pub fn abort(&self) {
        self.reader_handle.abort();
    }

    /// Whether the reader task has exited, i.e. the transport is gone or
    /// has been torn down. Polled by the liveness monitor.
    pub fn is_closing(&self) -> bool {
        self.reader_handle.is_finished()
    }
}

impl Drop for NotificationSession {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Parses one incoming line and routes it: a reply (has `id`, no
/// `method`) completes the matching pending request; a notification (has
/// `method`, no numeric `id` matching a pending request) updates the
/// subscription cache and fans out to every queue.
fn dispatch_incoming(
    line: &str,
    pending: &Mutex<BTreeMap<u64, oneshot::Sender<InterfaceResult<Value>>>>,
    subscriptions: &Mutex<HashMap<SubscriptionKey, SubscriptionState>>,
    peer_label: &str,
) -> InterfaceResult<()> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if value.get("method").is_none() {
            let sender = pending.lock().remove(&id);
            let Some(sender) = sender else {
                debug!(peer = %peer_label, id, "reply for unknown/already-resolved request id");
                return Ok(());
            };
            if let Some(error) = value.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let _ = sender.send(Err(InterfaceError::Rpc { code, message }));
            } else {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                let _ = sender.send(Ok(result));
            }
            return Ok(());
        }
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| InterfaceError::Protocol(ProtocolError::Malformed(
            "message has neither a resolvable id nor a method".to_string(),
        )))?
        .to_string();
    let params = value
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    // The leading arguments (all but the last) combine with the method to
    // form the subscription key; the last argument is the new value.
    let (key_params, new_value) = match params.split_last() {
        Some((last, rest)) => (rest.to_vec(), last.clone()),
        None => (Vec::new(), Value::Null),
    };
    let key = SubscriptionKey::new(&method, &key_params);

    let mut subs = subscriptions.lock();
    match subs.get_mut(&key) {
        Some(entry) => {
            entry.cached = Some(new_value.clone());
            entry.queues.retain(|q| q.send(new_value.clone()).is_ok());
            Ok(())
        }
        None => Err(InterfaceError::Protocol(ProtocolError::UnknownSubscription(
            method,
        ))),
    }
}
