//! Per-stream byte buffers fed by the listener, drained by readers.
//!
//! Buffers are registered before their stream id is ever disclosed to
//! the host, so no early chunk can race past registration. Producers
//! may run arbitrarily far ahead of consumers; chunks queue in arrival
//! order, which is the only ordering guarantee. A terminal event (end
//! or error) removes the registry entry; memory is released once the
//! reader drains.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::lock;

/// One event on a stream buffer.
#[derive(Debug)]
enum StreamEvent {
    Data(Vec<u8>),
    End,
    Error(String),
}

/// Registry mapping stream id → the feeding half of its buffer.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    entries: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamEvent>>>,
}

impl StreamTable {
    /// Registers a buffer for `stream_id` and returns its reader.
    pub(crate) fn register(&self, stream_id: u64) -> StreamReader {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.entries).insert(stream_id, tx);
        StreamReader {
            stream_id,
            events: rx,
            buffered: Vec::new(),
            state: ReaderState::Open,
        }
    }

    /// Appends a chunk to a registered buffer.
    ///
    /// Chunks for unregistered (or already abandoned) stream ids are
    /// dropped silently — the consumer stopped caring.
    pub(crate) fn feed(&self, stream_id: u64, chunk: Vec<u8>) {
        let mut entries = lock(&self.entries);
        match entries.get(&stream_id) {
            Some(tx) => {
                if tx.send(StreamEvent::Data(chunk)).is_err() {
                    trace!(stream_id, "reader gone, discarding buffer entry");
                    entries.remove(&stream_id);
                }
            }
            None => trace!(stream_id, "chunk for unregistered stream dropped"),
        }
    }

    /// Marks a stream ended; the entry is removed.
    pub(crate) fn end(&self, stream_id: u64) {
        if let Some(tx) = lock(&self.entries).remove(&stream_id) {
            let _ = tx.send(StreamEvent::End);
        }
    }

    /// Marks a stream errored; the entry is removed.
    pub(crate) fn fail(&self, stream_id: u64, message: &str) {
        if let Some(tx) = lock(&self.entries).remove(&stream_id) {
            let _ = tx.send(StreamEvent::Error(message.to_owned()));
        }
    }

    /// Fails every registered buffer. Connection-loss cleanup: undrained
    /// buffers must error out rather than hang their readers forever.
    pub(crate) fn fail_all(&self, message: &str) {
        for (_, tx) in lock(&self.entries).drain() {
            let _ = tx.send(StreamEvent::Error(message.to_owned()));
        }
    }

    /// Discards a registration whose id was never disclosed usefully
    /// (e.g. the call that would have used it failed).
    pub(crate) fn discard(&self, stream_id: u64) {
        lock(&self.entries).remove(&stream_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[derive(Debug)]
enum ReaderState {
    Open,
    Ended,
    Failed(String),
}

/// Reader half of one stream buffer.
#[derive(Debug)]
pub struct StreamReader {
    stream_id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    buffered: Vec<u8>,
    state: ReaderState,
}

impl StreamReader {
    /// The stream this reader drains.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Reads up to `max` bytes.
    ///
    /// Blocks while the buffer is empty and the stream is open; returns
    /// fewer than `max` bytes only once the stream has terminated. At
    /// end-of-stream the result is empty. Bytes queued before a
    /// recorded error are delivered first; the error is raised once
    /// they are drained.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        self.fill(max).await;
        if !self.buffered.is_empty() {
            let take = max.min(self.buffered.len());
            return Ok(self.buffered.drain(..take).collect());
        }
        self.terminal()
    }

    /// Reads whatever is queued, blocking only while nothing is.
    ///
    /// Returns as soon as the buffer is non-empty, however little it
    /// holds; an empty result means end-of-stream. For consumers that
    /// relay output as it arrives instead of filling fixed-size
    /// buffers.
    pub async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        self.fill(1).await;
        if !self.buffered.is_empty() {
            return Ok(std::mem::take(&mut self.buffered));
        }
        self.terminal()
    }

    /// Receives events until `target` bytes are buffered or the stream
    /// terminates.
    async fn fill(&mut self, target: usize) {
        while self.buffered.len() < target && matches!(self.state, ReaderState::Open) {
            match self.events.recv().await {
                Some(StreamEvent::Data(chunk)) => self.buffered.extend_from_slice(&chunk),
                Some(StreamEvent::End) => self.state = ReaderState::Ended,
                Some(StreamEvent::Error(message)) => self.state = ReaderState::Failed(message),
                // Sender vanished without a terminal event.
                None => self.state = ReaderState::Failed("stream closed".to_owned()),
            }
        }
    }

    /// The result once the buffer is drained: empty at end-of-stream,
    /// the recorded error after a failure.
    fn terminal(&self) -> Result<Vec<u8>> {
        match &self.state {
            ReaderState::Failed(message) => Err(Error::Stream {
                stream_id: self.stream_id,
                message: message.clone(),
            }),
            _ => Ok(Vec::new()),
        }
    }

    /// Drains the stream to end-of-stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }
}
