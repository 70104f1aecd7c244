//! Error taxonomy and the single wire-error decoder.
//!
//! Wire error shapes are decoded here and nowhere else: the listener
//! hands raw envelopes to [`Error::from_wire`] / [`Error::from_result_error`]
//! and every other module sees only the typed variants.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use tether_proto::{ResultEnvelope, WireError, from_wire};

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// One structured complaint from a remote parameter-validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    /// Dotted path of the offending field.
    pub path: String,
    /// Type the host expected there.
    pub expected: String,
    /// Human-readable description.
    pub message: String,
}

/// Errors surfaced by tether operations.
///
/// `Clone` so terminal results (e.g. a cached process exit) can be
/// handed to multiple observers; the uploader's original I/O failure is
/// therefore held behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection never came up, or closed while work was pending.
    #[error("transport: {0}")]
    Transport(String),

    /// The host does not know the requested method.
    #[error("remote method not found: {method}")]
    MethodNotFound {
        /// The method the host rejected.
        method: String,
    },

    /// The host rejected the call parameters.
    #[error("invalid parameters ({} issue(s))", issues.len())]
    Validation {
        /// Per-field detail for diagnostics.
        issues: Vec<FieldIssue>,
    },

    /// A domain-specific failure reported by the host.
    #[error("remote error [{tag}]: {message}")]
    Remote {
        /// Constructor-like tag identifying the failure kind.
        tag: String,
        /// Human-readable description.
        message: String,
    },

    /// A local byte source failed mid-upload; the host was told via a
    /// stream-error notification before this was raised.
    #[error("upload stream {stream_id} abandoned")]
    StreamAbandoned {
        /// The abandoned stream.
        stream_id: u64,
        /// The original source failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// A stream buffer was marked errored before being drained.
    #[error("stream {stream_id} failed: {message}")]
    Stream {
        /// The failed stream.
        stream_id: u64,
        /// Recorded failure description.
        message: String,
    },
}

/// Tag used by the host for operations on an already-terminated process.
const ALREADY_EXITED: &str = "AlreadyExitedError";

impl Error {
    /// Whether this is the host's "process already exited" error.
    ///
    /// `kill()` swallows it; `wait()`/`status()` surface it.
    pub fn is_already_exited(&self) -> bool {
        matches!(self, Self::Remote { tag, .. } if tag == ALREADY_EXITED)
    }

    /// Decodes a top-level wire error (`{id, error: {message, data}}`).
    ///
    /// Dispatch is on `(error.message, error.data.name)`:
    /// method-not-found and validation get their own variants, anything
    /// else becomes [`Error::Remote`] tagged with `data.name` when
    /// present.
    pub(crate) fn from_wire(method: &str, err: WireError) -> Self {
        let tag = err
            .data
            .as_ref()
            .and_then(|d| d.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        if tag == "MethodNotFoundError" || err.message == "method not found" {
            return Self::MethodNotFound {
                method: method.to_owned(),
            };
        }
        if tag == "ValidationError" || err.message == "invalid params" {
            return Self::Validation {
                issues: decode_issues(err.data.as_ref()),
            };
        }
        if tag.is_empty() {
            return Self::Remote {
                tag: "Error".to_owned(),
                message: err.message,
            };
        }
        Self::Remote {
            tag,
            message: err.message,
        }
    }

    /// Decodes a logical error carried inside a successful envelope
    /// (`result: {error: {...}}`), e.g. `AlreadyExitedError`.
    pub(crate) fn from_result_error(value: Value) -> Self {
        let value = from_wire(value);
        let tag = value
            .get("code")
            .or_else(|| value.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Error")
            .to_owned();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Self::Remote { tag, message }
    }
}

/// Extracts `{path, expected, message}` entries from validation data.
fn decode_issues(data: Option<&Value>) -> Vec<FieldIssue> {
    let issues = data
        .and_then(|d| d.get("issues"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    issues
        .iter()
        .map(|issue| FieldIssue {
            path: issue
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            expected: issue
                .get("expected")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            message: issue
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        })
        .collect()
}

/// Resolves a full response envelope into the caller's result.
///
/// Top-level errors win over the result envelope; a result with a
/// logical error maps through [`Error::from_result_error`]; `ok` values
/// are translated back from wire casing; an empty response is `null`.
pub(crate) fn resolve_response(
    method: &str,
    result: Option<ResultEnvelope>,
    error: Option<WireError>,
) -> Result<Value> {
    if let Some(err) = error {
        return Err(Error::from_wire(method, err));
    }
    match result {
        Some(ResultEnvelope {
            error: Some(app), ..
        }) => Err(Error::from_result_error(app)),
        Some(ResultEnvelope { ok: Some(ok), .. }) => Ok(from_wire(ok)),
        _ => Ok(Value::Null),
    }
}
