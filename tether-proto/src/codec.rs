//! JSON text codec: one object per message, base64 chunk payloads.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::message::{Incoming, RawIncoming, StreamControl, methods};

/// Maximum accepted incoming message (16 MiB of JSON text).
const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Encodes an outgoing call. `params` must already be wire-cased.
pub fn encode_call(id: u64, method: &str, params: Value) -> String {
    json!({ "id": id, "method": method, "params": params }).to_string()
}

/// Encodes a stream-control notification (no id).
///
/// `data` is a pre-encoded base64 chunk for [`methods::STREAM_CHUNK`];
/// `error` is the failure description for [`methods::STREAM_ERROR`].
pub fn encode_stream_notification(
    method: &str,
    stream_id: u64,
    data: Option<&str>,
    error: Option<&str>,
) -> String {
    let mut params = serde_json::Map::new();
    params.insert("streamId".to_owned(), json!(stream_id));
    if let Some(data) = data {
        params.insert("data".to_owned(), json!(data));
    }
    if let Some(error) = error {
        params.insert("error".to_owned(), json!(error));
    }
    json!({ "method": method, "params": Value::Object(params) }).to_string()
}

/// Encodes a binary chunk for the text wire.
pub fn encode_chunk(chunk: &[u8]) -> String {
    BASE64.encode(chunk)
}

/// Decodes a base64 chunk payload.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// Classifies one incoming message.
///
/// A message with an `id` is a response; one with a reserved stream
/// method is a stream-control notification; everything else — including
/// unparseable or oversized traffic — is [`Incoming::Other`] and gets
/// ignored upstream.
pub fn classify(text: &str) -> Incoming {
    if text.len() > MAX_MESSAGE {
        return Incoming::Other;
    }
    let raw: RawIncoming = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(_) => return Incoming::Other,
    };

    if let Some(id) = raw.id {
        return Incoming::Response {
            id,
            result: raw.result,
            error: raw.error,
        };
    }

    let Some(method) = raw.method.as_deref() else {
        return Incoming::Other;
    };
    if !methods::is_stream_control(method) {
        return Incoming::Other;
    }
    let Some(params) = raw.params else {
        return Incoming::Other;
    };
    let Ok(params) = serde_json::from_value(params) else {
        return Incoming::Other;
    };
    let control = match method {
        methods::STREAM_START => StreamControl::Start,
        methods::STREAM_CHUNK => StreamControl::Chunk,
        methods::STREAM_END => StreamControl::End,
        _ => StreamControl::Error,
    };
    Incoming::Stream(control, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_roundtrips_through_classify_as_other() {
        // A call echoed back would carry an id, so it classifies as a
        // response; a notification we emit must classify as a stream.
        let text = encode_stream_notification(methods::STREAM_CHUNK, 7, Some("aGk="), None);
        match classify(&text) {
            Incoming::Stream(StreamControl::Chunk, params) => {
                assert_eq!(params.stream_id, 7);
                assert_eq!(params.data.as_deref(), Some("aGk="));
            }
            other => panic!("expected stream chunk, got {other:?}"),
        }
    }

    #[test]
    fn classifies_ok_response() {
        let text = r#"{"id": 3, "result": {"ok": {"pid": 42}}}"#;
        match classify(text) {
            Incoming::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert!(error.is_none());
                let ok = result.and_then(|r| r.ok).expect("ok value");
                assert_eq!(ok["pid"], 42);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_top_level_error_response() {
        let text = r#"{"id": 9, "error": {"message": "boom", "data": {"name": "Kaput"}}}"#;
        match classify(text) {
            Incoming::Response { id, error, .. } => {
                assert_eq!(id, 9);
                assert_eq!(error.expect("error").message, "boom");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_end_and_error_notifications() {
        let end = encode_stream_notification(methods::STREAM_END, 4, None, None);
        assert!(matches!(
            classify(&end),
            Incoming::Stream(StreamControl::End, _)
        ));

        let err = encode_stream_notification(methods::STREAM_ERROR, 4, None, Some("lost"));
        match classify(&err) {
            Incoming::Stream(StreamControl::Error, params) => {
                assert_eq!(params.error.as_deref(), Some("lost"));
            }
            other => panic!("expected stream error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_method_and_garbage_are_other() {
        assert!(matches!(
            classify(r#"{"method": "serverGossip", "params": {}}"#),
            Incoming::Other
        ));
        assert!(matches!(classify("not json at all"), Incoming::Other));
        assert!(matches!(classify(r#"{"params": {"streamId": 1}}"#), Incoming::Other));
    }

    #[test]
    fn chunk_encoding_roundtrips() {
        let bytes = [0u8, 1, 2, 254, 255];
        let encoded = encode_chunk(&bytes);
        assert_eq!(decode_chunk(&encoded).expect("decode"), bytes);
    }

    #[test]
    fn encode_call_shape() {
        let text = encode_call(12, methods::FILE_READ, json!({"path": "a.txt"}));
        let value: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["id"], 12);
        assert_eq!(value["method"], "fileRead");
        assert_eq!(value["params"]["path"], "a.txt");
    }
}
