//! Protocol message shapes for client↔host communication.

use serde::Deserialize;
use serde_json::Value;

/// Method names understood by the remote host.
///
/// Call methods are camelCase on the wire; the four `stream*` names are
/// the reserved stream-control notification set.
pub mod methods {
    /// Health-check call.
    pub const PING: &str = "ping";
    /// Cancel an in-flight operation identified by an abort-signal id.
    pub const ABORT: &str = "abort";
    /// Spawn a remote process.
    pub const PROCESS_SPAWN: &str = "processSpawn";
    /// Wait for a remote process to exit.
    pub const PROCESS_WAIT: &str = "processWait";
    /// Kill a remote process.
    pub const PROCESS_KILL: &str = "processKill";
    /// Send a POSIX signal to a remote process.
    pub const PROCESS_SIGNAL: &str = "processSignal";
    /// Read a file on the remote host.
    pub const FILE_READ: &str = "fileRead";
    /// Write a file on the remote host.
    pub const FILE_WRITE: &str = "fileWrite";

    /// Open a chunked byte stream.
    pub const STREAM_START: &str = "streamStart";
    /// Enqueue one base64 chunk on a stream.
    pub const STREAM_CHUNK: &str = "streamChunk";
    /// Close a stream after its final chunk.
    pub const STREAM_END: &str = "streamEnd";
    /// Abandon a stream with an error description.
    pub const STREAM_ERROR: &str = "streamError";

    /// Whether `method` belongs to the reserved stream-control set.
    pub fn is_stream_control(method: &str) -> bool {
        matches!(method, STREAM_START | STREAM_CHUNK | STREAM_END | STREAM_ERROR)
    }
}

/// The `result` envelope of a response: `{ok}` on success, `{error}`
/// when the call reached the host but failed logically.
#[derive(Debug, Deserialize)]
pub struct ResultEnvelope {
    /// Successful result value, wire-cased.
    #[serde(default)]
    pub ok: Option<Value>,
    /// Structured application error value, wire-cased.
    #[serde(default)]
    pub error: Option<Value>,
}

/// Top-level `error` object of a response.
#[derive(Debug, Deserialize)]
pub struct WireError {
    /// Human-readable error message.
    pub message: String,
    /// Additional error payload (constructor tag, field issues, ...).
    #[serde(default)]
    pub data: Option<Value>,
}

/// Parameters of a stream-control notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    /// Stream this notification addresses.
    pub stream_id: u64,
    /// Base64 chunk payload (`streamChunk` only).
    #[serde(default)]
    pub data: Option<String>,
    /// Failure description (`streamError` only).
    #[serde(default)]
    pub error: Option<String>,
}

/// Which stream-control notification arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamControl {
    /// Stream opened.
    Start,
    /// One chunk enqueued.
    Chunk,
    /// Stream closed after its final chunk.
    End,
    /// Stream abandoned with an error.
    Error,
}

/// One classified incoming message.
#[derive(Debug)]
#[non_exhaustive]
pub enum Incoming {
    /// A response correlated to a prior call by id.
    Response {
        /// The call id this response answers.
        id: u64,
        /// Result envelope, if present.
        result: Option<ResultEnvelope>,
        /// Top-level error, if present.
        error: Option<WireError>,
    },
    /// A stream-control notification.
    Stream(StreamControl, StreamParams),
    /// Anything else: unrecognized notification or unparseable traffic.
    Other,
}

/// Loose shape every incoming message is first parsed into.
#[derive(Debug, Deserialize)]
pub(crate) struct RawIncoming {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<ResultEnvelope>,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub params: Option<Value>,
}
