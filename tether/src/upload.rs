//! Chunked byte uploads over host-bound streams.
//!
//! An upload allocates a fresh stream id, announces it, pumps the
//! source as base64 chunk notifications, and terminates the stream
//! exactly once: with an end marker on success or a single error
//! notification if the source fails partway. Nothing follows the
//! terminal notification.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use tether_proto::{encode_chunk, methods};

use crate::error::{Error, Result};
use crate::rpc::RpcClient;

/// Default upload chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes to upload: already in memory, readable, or produced lazily.
pub enum ByteSource {
    /// A complete in-memory buffer, sent as a single chunk.
    Bytes(Vec<u8>),
    /// An async reader drained in chunk-sized reads.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// A fallible stream of buffers; oversized items are re-chunked.
    Stream(Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>),
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for ByteSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for ByteSource {
    fn from(text: String) -> Self {
        Self::Bytes(text.into_bytes())
    }
}

impl From<&str> for ByteSource {
    fn from(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }
}

/// Why a pump stopped: the source broke, or the wire did.
enum PumpError {
    Source(io::Error),
    Transport(Error),
}

impl RpcClient {
    /// Uploads a byte source over a fresh host-bound stream and returns
    /// the stream id for use in a follow-up call.
    ///
    /// A `chunk_size` of `None` uses [`DEFAULT_CHUNK_SIZE`]. If the
    /// source fails mid-transfer the host receives one stream-error
    /// notification and the original failure is returned as
    /// [`Error::StreamAbandoned`].
    pub async fn upload(
        &self,
        source: impl Into<ByteSource>,
        chunk_size: Option<usize>,
    ) -> Result<u64> {
        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let stream_id = self.alloc_stream_id();

        self.notify_stream(methods::STREAM_START, stream_id, None, None)
            .await?;

        match self.pump(stream_id, source.into(), chunk_size).await {
            Ok(()) => {
                self.notify_stream(methods::STREAM_END, stream_id, None, None)
                    .await?;
                Ok(stream_id)
            }
            Err(PumpError::Source(e)) => {
                debug!(stream_id, "source failed mid-upload: {e}");
                // Best effort: if the wire is also gone the host will
                // observe connection loss instead.
                let _ = self
                    .notify_stream(methods::STREAM_ERROR, stream_id, None, Some(&e.to_string()))
                    .await;
                Err(Error::StreamAbandoned {
                    stream_id,
                    source: Arc::new(e),
                })
            }
            Err(PumpError::Transport(e)) => Err(e),
        }
    }

    /// Sends one data chunk on a host-bound stream.
    pub(crate) async fn send_chunk(&self, stream_id: u64, bytes: &[u8]) -> Result<()> {
        self.notify_stream(
            methods::STREAM_CHUNK,
            stream_id,
            Some(&encode_chunk(bytes)),
            None,
        )
        .await
    }

    /// Drains the source into chunk notifications.
    async fn pump(
        &self,
        stream_id: u64,
        source: ByteSource,
        chunk_size: usize,
    ) -> std::result::Result<(), PumpError> {
        let send = |bytes: Vec<u8>| async move {
            self.send_chunk(stream_id, &bytes)
                .await
                .map_err(PumpError::Transport)
        };

        match source {
            ByteSource::Bytes(bytes) => {
                if !bytes.is_empty() {
                    send(bytes).await?;
                }
            }
            ByteSource::Reader(mut reader) => loop {
                let mut buf = vec![0u8; chunk_size];
                let n = reader.read(&mut buf).await.map_err(PumpError::Source)?;
                if n == 0 {
                    break;
                }
                buf.truncate(n);
                send(buf).await?;
            },
            ByteSource::Stream(mut stream) => {
                while let Some(item) = stream.next().await {
                    let bytes = item.map_err(PumpError::Source)?;
                    for piece in bytes.chunks(chunk_size) {
                        send(piece.to_vec()).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
