//! Remote file helpers: whole-file reads and writes over the RPC
//! surface, with uploads for content that is not in memory.

use serde_json::{Value, json};

use tether_proto::{decode_chunk, encode_chunk, methods};

use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use crate::upload::ByteSource;

/// Options for a partial or cancellable file read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Maximum number of bytes to read.
    pub length: Option<u64>,
    /// Byte offset to start reading from.
    pub offset: Option<u64>,
    /// Abort-signal id (from [`RpcClient::alloc_abort_id`]) that can
    /// cancel the read while it is in flight.
    pub abort_id: Option<u64>,
}

impl RpcClient {
    /// Reads a whole remote file into memory.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read_file_with(path, ReadOptions::default()).await
    }

    /// Reads a remote file with explicit range and cancellation options.
    pub async fn read_file_with(&self, path: &str, options: ReadOptions) -> Result<Vec<u8>> {
        let mut params = serde_json::Map::new();
        params.insert("path".into(), json!(path));
        if let Some(length) = options.length {
            params.insert("length".into(), json!(length));
        }
        if let Some(offset) = options.offset {
            params.insert("offset".into(), json!(offset));
        }
        if let Some(abort_id) = options.abort_id {
            params.insert("abort_id".into(), json!(abort_id));
        }

        let result = self.call(methods::FILE_READ, Value::Object(params)).await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transport("malformed fileRead result: missing data".to_owned()))?;
        decode_chunk(data)
            .map_err(|e| Error::Transport(format!("malformed fileRead result: {e}")))
    }

    /// Writes an in-memory buffer to a remote file.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.call(
            methods::FILE_WRITE,
            json!({ "path": path, "data": encode_chunk(contents) }),
        )
        .await
        .map(drop)
    }

    /// Writes a remote file from a byte source, streaming the content
    /// up first and then committing it to `path` in one call.
    pub async fn write_file_from(
        &self,
        path: &str,
        source: impl Into<ByteSource>,
        chunk_size: Option<usize>,
    ) -> Result<()> {
        let stream_id = self.upload(source, chunk_size).await?;
        self.call(
            methods::FILE_WRITE,
            json!({ "path": path, "stream_id": stream_id }),
        )
        .await
        .map(drop)
    }
}
