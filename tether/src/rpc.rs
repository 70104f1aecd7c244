//! The RPC client: id assignment, pending-call table, listener loop.
//!
//! One listener task per connection reads every incoming message and
//! classifies it: a response completes its pending call, a
//! stream-control notification feeds the matching buffer, anything else
//! is ignored. When the connection drops, every pending call and every
//! registered stream buffer is failed so no caller blocks forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use tether_proto::{
    Incoming, StreamControl, StreamParams, classify, decode_chunk, encode_call,
    encode_stream_notification, methods, to_wire,
};

use crate::conn::Connection;
use crate::error::{Error, Result, resolve_response};
use crate::lock;
use crate::stream::{StreamReader, StreamTable};

/// Pending call: the method (for error mapping) and the completion side.
type PendingEntry = (String, oneshot::Sender<Result<Value>>);

/// Client for issuing concurrent calls over one connection.
///
/// Cheap to clone; all clones share the connection, the pending-call
/// table and the three id counters (request, stream, abort-signal —
/// distinct id spaces, each owned by this instance so multiple
/// connections in one process stay independent).
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    outgoing: mpsc::Sender<String>,
    /// Taken by the listener on first call.
    incoming: Mutex<Option<mpsc::Receiver<String>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// `None` once the connection is down; inserts fail fast after that.
    pending: Mutex<Option<HashMap<u64, PendingEntry>>>,
    pub(crate) streams: StreamTable,
    next_request_id: AtomicU64,
    next_stream_id: AtomicU64,
    next_abort_id: AtomicU64,
}

impl RpcClient {
    /// Wraps an established connection. The listener starts lazily on
    /// the first call.
    pub fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Inner {
                outgoing: conn.outgoing,
                incoming: Mutex::new(Some(conn.incoming)),
                listener: Mutex::new(None),
                pending: Mutex::new(Some(HashMap::new())),
                streams: StreamTable::default(),
                next_request_id: AtomicU64::new(1),
                next_stream_id: AtomicU64::new(1),
                next_abort_id: AtomicU64::new(1),
            }),
        }
    }

    /// Issues one call and awaits its correlated response.
    ///
    /// `params` uses snake_case field names; translation to the wire
    /// convention (and back, for the result) happens here and nowhere
    /// else.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_listener();

        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let text = encode_call(id, method, to_wire(params));

        let reply = {
            let mut guard = lock(&self.inner.pending);
            let Some(table) = guard.as_mut() else {
                return Err(connection_closed());
            };
            let (tx, rx) = oneshot::channel();
            table.insert(id, (method.to_owned(), tx));
            rx
        };

        if self.inner.outgoing.send(text).await.is_err() {
            // Take our entry back out so the table never leaks it.
            if let Some(table) = lock(&self.inner.pending).as_mut() {
                table.remove(&id);
            }
            return Err(connection_closed());
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(connection_closed()),
        }
    }

    /// Health-check round trip.
    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, json!({})).await.map(drop)
    }

    /// Allocates an abort-signal id for a cancellable operation.
    pub fn alloc_abort_id(&self) -> u64 {
        self.inner.next_abort_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Requests cancellation of the in-flight operation that was issued
    /// with `abort_id`.
    pub async fn abort(&self, abort_id: u64) -> Result<()> {
        self.call(methods::ABORT, json!({ "abort_id": abort_id }))
            .await
            .map(drop)
    }

    /// Registers a stream buffer and returns its id and reader.
    ///
    /// Registration happens before the id is returned, so it is
    /// impossible to disclose the id to the host before the buffer
    /// exists — early chunks cannot be dropped by that race.
    pub fn open_stream(&self) -> (u64, StreamReader) {
        let stream_id = self.alloc_stream_id();
        let reader = self.inner.streams.register(stream_id);
        (stream_id, reader)
    }

    /// Allocates a stream id without registering a buffer (outbound
    /// streams: the host is the consumer).
    pub(crate) fn alloc_stream_id(&self) -> u64 {
        self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one stream-control notification.
    pub(crate) async fn notify_stream(
        &self,
        method: &str,
        stream_id: u64,
        data: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let text = encode_stream_notification(method, stream_id, data, error);
        self.inner
            .outgoing
            .send(text)
            .await
            .map_err(|_| connection_closed())
    }

    /// Drops a buffer registration that will never be fed.
    pub(crate) fn discard_stream(&self, stream_id: u64) {
        self.inner.streams.discard(stream_id);
    }

    #[cfg(test)]
    pub(crate) fn registered_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Stops the listener and fails everything still pending.
    ///
    /// Further calls return a transport error immediately.
    pub fn close(&self) {
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
        }
        self.inner.shutdown("connection closed locally");
    }

    /// Starts the single listener task if it is not running yet.
    fn ensure_listener(&self) {
        let mut guard = lock(&self.inner.listener);
        if guard.is_some() {
            return;
        }
        let Some(incoming) = lock(&self.inner.incoming).take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(listen(inner, incoming)));
    }
}

impl Inner {
    /// Connection-loss cleanup: broadcast a terminal transport error to
    /// every pending call and every undrained stream buffer.
    fn shutdown(&self, reason: &str) {
        if let Some(table) = lock(&self.pending).take() {
            for (_, (_, tx)) in table {
                let _ = tx.send(Err(Error::Transport(reason.to_owned())));
            }
        }
        self.streams.fail_all(reason);
    }
}

/// The listener: reads one fully-ordered message at a time until the
/// connection ends, then runs shutdown cleanup.
async fn listen(inner: Arc<Inner>, mut incoming: mpsc::Receiver<String>) {
    debug!("rpc listener started");
    while let Some(text) = incoming.recv().await {
        match classify(&text) {
            Incoming::Response { id, result, error } => {
                let entry = lock(&inner.pending).as_mut().and_then(|t| t.remove(&id));
                match entry {
                    Some((method, tx)) => {
                        let _ = tx.send(resolve_response(&method, result, error));
                    }
                    None => trace!(id, "response for unknown or completed call"),
                }
            }
            Incoming::Stream(control, params) => dispatch_stream(&inner, control, params),
            Incoming::Other => trace!("ignoring unrecognized message"),
            _ => {}
        }
    }
    inner.shutdown("connection closed");
    debug!("rpc listener stopped");
}

/// Routes one stream-control notification into the buffer registry.
fn dispatch_stream(inner: &Inner, control: StreamControl, params: StreamParams) {
    let stream_id = params.stream_id;
    match control {
        // The host announces its own streams; buffers were registered
        // when the ids were allocated, so this is informational.
        StreamControl::Start => trace!(stream_id, "host opened stream"),
        StreamControl::Chunk => {
            let Some(data) = params.data else {
                trace!(stream_id, "chunk notification without data");
                return;
            };
            match decode_chunk(&data) {
                Ok(bytes) => inner.streams.feed(stream_id, bytes),
                Err(e) => inner
                    .streams
                    .fail(stream_id, &format!("undecodable chunk: {e}")),
            }
        }
        StreamControl::End => inner.streams.end(stream_id),
        StreamControl::Error => inner
            .streams
            .fail(stream_id, params.error.as_deref().unwrap_or("stream error")),
        _ => {}
    }
}

fn connection_closed() -> Error {
    Error::Transport("connection closed".to_owned())
}
