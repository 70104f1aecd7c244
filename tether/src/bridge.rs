//! Blocking facade for callers without an async runtime.
//!
//! A [`Bridge`] owns one background thread running a single-threaded
//! runtime with a cooperative task set. Blocking wrappers package each
//! operation as a job, post it to the worker, and park on a reply
//! channel; the worker keeps polling the connection's tasks while any
//! individual job is parked, so concurrent operations make progress.
//!
//! Jobs must never call back into [`Bridge::run`]: the worker would be
//! waiting on itself.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::debug;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::fs::ReadOptions;
use crate::lock;
use crate::process::{Command, ExitStatus, ProcessHandle};
use crate::rpc::RpcClient;
use crate::stream::StreamReader;
use crate::upload::ByteSource;

/// A job: runs on the worker thread, replies through its own channel.
/// The produced future is polled on the worker's task set and need not
/// be `Send`.
type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()>>> + Send>;

/// Background async worker shared by the blocking wrappers.
#[derive(Debug)]
pub struct Bridge {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Bridge {
    /// Starts the worker thread and its runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("tether-bridge".to_owned())
            .spawn(move || worker_main(runtime, jobs_rx))?;
        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Runs one async operation on the worker and blocks for its output.
    ///
    /// The closure is invoked on the worker thread; the future it
    /// builds is cooperatively scheduled next to every other in-flight
    /// job. Returns [`Error::Transport`] if the worker has stopped.
    pub fn run<F, T>(&self, op: impl FnOnce() -> F + Send + 'static) -> Result<T>
    where
        F: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply_tx.send(op().await);
            })
        });

        let posted = lock(&self.jobs)
            .as_ref()
            .is_some_and(|tx| tx.send(job).is_ok());
        if !posted {
            return Err(worker_stopped());
        }
        reply_rx.recv().map_err(|_| worker_stopped())
    }

    /// Stops accepting jobs and joins the worker. In-flight jobs are
    /// abandoned; their callers observe a transport error.
    pub fn stop(&self) {
        lock(&self.jobs).take();
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: spawn each arriving job onto the local task set so jobs
/// interleave instead of queueing behind one another.
fn worker_main(runtime: tokio::runtime::Runtime, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(job) = jobs.recv().await {
            tokio::task::spawn_local(job());
        }
        debug!("sync worker draining");
    });
}

fn worker_stopped() -> Error {
    Error::Transport("sync worker stopped".to_owned())
}

/// Blocking counterpart of [`RpcClient`].
#[derive(Debug)]
pub struct SyncClient {
    bridge: Arc<Bridge>,
    client: RpcClient,
}

impl SyncClient {
    /// Connects to the host and wraps the session in blocking calls.
    pub fn connect(url: &str, token: &str, config_b64: &str) -> Result<Self> {
        let bridge = Arc::new(
            Bridge::new()
                .map_err(|e| Error::Transport(format!("failed to start sync worker: {e}")))?,
        );
        let (url, token, config_b64) =
            (url.to_owned(), token.to_owned(), config_b64.to_owned());
        let client = bridge.run(move || async move {
            let conn = Connection::websocket(&url, &token, &config_b64).await?;
            Ok::<_, Error>(RpcClient::new(conn))
        })??;
        Ok(Self { bridge, client })
    }

    /// Wraps an existing client on an existing bridge. For embedders
    /// supplying their own transport (e.g. [`Connection::pipe`]).
    pub fn with_client(bridge: Arc<Bridge>, client: RpcClient) -> Self {
        Self { bridge, client }
    }

    /// Blocking [`RpcClient::call`].
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        let client = self.client.clone();
        let method = method.to_owned();
        self.bridge
            .run(move || async move { client.call(&method, params).await })?
    }

    /// Blocking [`RpcClient::ping`].
    pub fn ping(&self) -> Result<()> {
        let client = self.client.clone();
        self.bridge.run(move || async move { client.ping().await })?
    }

    /// Blocking [`RpcClient::read_file`].
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read_file_with(path, ReadOptions::default())
    }

    /// Blocking [`RpcClient::read_file_with`].
    pub fn read_file_with(&self, path: &str, options: ReadOptions) -> Result<Vec<u8>> {
        let client = self.client.clone();
        let path = path.to_owned();
        self.bridge
            .run(move || async move { client.read_file_with(&path, options).await })?
    }

    /// Blocking [`RpcClient::write_file`].
    pub fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let client = self.client.clone();
        let path = path.to_owned();
        let contents = contents.to_vec();
        self.bridge
            .run(move || async move { client.write_file(&path, &contents).await })?
    }

    /// Blocking [`RpcClient::upload`].
    pub fn upload(&self, source: impl Into<ByteSource>, chunk_size: Option<usize>) -> Result<u64> {
        let client = self.client.clone();
        let source = source.into();
        self.bridge
            .run(move || async move { client.upload(source, chunk_size).await })?
    }

    /// Blocking [`Command::spawn`].
    pub fn spawn(&self, command: Command) -> Result<SyncProcess> {
        let client = self.client.clone();
        let handle = self
            .bridge
            .run(move || async move { command.spawn(&client).await })??;
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();
        Ok(SyncProcess {
            handle,
            stdout,
            stderr,
            bridge: Arc::clone(&self.bridge),
        })
    }

    /// Tears down the session and the worker thread.
    pub fn close(&self) {
        self.client.close();
        self.bridge.stop();
    }
}

/// Blocking counterpart of [`ProcessHandle`], with the output readers
/// held on this side of the bridge.
#[derive(Debug)]
pub struct SyncProcess {
    handle: ProcessHandle,
    stdout: Option<StreamReader>,
    stderr: Option<StreamReader>,
    bridge: Arc<Bridge>,
}

impl SyncProcess {
    /// Host-assigned process id.
    pub fn pid(&self) -> u64 {
        self.handle.pid()
    }

    /// Blocking [`ProcessHandle::wait`].
    pub fn wait(&self) -> Result<ExitStatus> {
        let handle = self.handle.clone();
        self.bridge.run(move || async move { handle.wait().await })?
    }

    /// The cached exit outcome; does not block or touch the worker.
    pub fn status(&self) -> Option<Result<ExitStatus>> {
        self.handle.status()
    }

    /// Blocking [`ProcessHandle::kill`].
    pub fn kill(&self) -> Result<()> {
        let handle = self.handle.clone();
        self.bridge.run(move || async move { handle.kill().await })?
    }

    /// Blocking [`ProcessHandle::signal`].
    pub fn signal(&self, signal: i32) -> Result<()> {
        let handle = self.handle.clone();
        self.bridge
            .run(move || async move { handle.signal(signal).await })?
    }

    /// Reads up to `max` bytes of stdout, blocking while the stream is
    /// open and empty. Empty result means end-of-stream (or stdout was
    /// not piped).
    pub fn read_stdout(&mut self, max: usize) -> Result<Vec<u8>> {
        Self::read_from(&self.bridge, &mut self.stdout, max)
    }

    /// Reads up to `max` bytes of stderr.
    pub fn read_stderr(&mut self, max: usize) -> Result<Vec<u8>> {
        Self::read_from(&self.bridge, &mut self.stderr, max)
    }

    /// Blocking [`ProcessHandle::write_stdin`].
    pub fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        let handle = self.handle.clone();
        let bytes = bytes.to_vec();
        self.bridge
            .run(move || async move { handle.write_stdin(&bytes).await })?
    }

    /// Blocking [`ProcessHandle::close_stdin`].
    pub fn close_stdin(&self) -> Result<()> {
        let handle = self.handle.clone();
        self.bridge
            .run(move || async move { handle.close_stdin().await })?
    }

    /// Detaches from the process; it keeps running on the host.
    pub fn close(&mut self) {
        self.stdout.take();
        self.stderr.take();
        let handle = self.handle.clone();
        let _ = self.bridge.run(move || async move { handle.close().await });
    }

    /// Ships the reader to the worker for one read, then takes it back.
    fn read_from(
        bridge: &Bridge,
        slot: &mut Option<StreamReader>,
        max: usize,
    ) -> Result<Vec<u8>> {
        let Some(mut reader) = slot.take() else {
            return Ok(Vec::new());
        };
        let (reader, result) = bridge.run(move || async move {
            let result = reader.read(max).await;
            (reader, result)
        })?;
        *slot = Some(reader);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Stdio;
    use serde_json::json;

    #[test]
    fn run_returns_the_job_output() {
        let bridge = Bridge::new().expect("bridge");
        let value = bridge.run(|| async { 41 + 1 }).expect("run");
        assert_eq!(value, 42);
    }

    #[test]
    fn errors_cross_the_thread_boundary_intact() {
        let bridge = Bridge::new().expect("bridge");
        let result: Result<()> = bridge
            .run(|| async {
                Err(Error::Remote {
                    tag: "NotFoundError".to_owned(),
                    message: "nope".to_owned(),
                })
            })
            .expect("worker alive");
        let err = result.expect_err("job failed");
        assert!(matches!(err, Error::Remote { tag, .. } if tag == "NotFoundError"));
    }

    #[test]
    fn usable_from_multiple_plain_threads() {
        let bridge = Arc::new(Bridge::new().expect("bridge"));
        let threads: Vec<_> = (0..4u64)
            .map(|n| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || bridge.run(move || async move { n * 2 }).expect("run"))
            })
            .collect();
        let mut results: Vec<u64> = threads
            .into_iter()
            .map(|t| t.join().expect("join"))
            .collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6]);
    }

    #[test]
    fn run_after_stop_is_a_transport_error() {
        let bridge = Bridge::new().expect("bridge");
        bridge.stop();
        let err = bridge.run(|| async { 1 }).expect_err("stopped");
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn sync_call_round_trips_over_a_pipe() {
        let bridge = Arc::new(Bridge::new().expect("bridge"));
        let (conn, mut peer) = Connection::pipe();
        let client = SyncClient::with_client(Arc::clone(&bridge), RpcClient::new(conn));

        let host = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("host runtime");
            rt.block_on(async move {
                let call = peer.recv_value().await.expect("call");
                assert_eq!(call["method"], "ping");
                let id = call["id"].as_u64().expect("id");
                peer.respond_ok(id, json!(null)).await;
            });
        });

        client.ping().expect("ping");
        host.join().expect("host");
        client.close();
    }

    #[test]
    fn sync_process_spawn_read_wait() {
        let bridge = Arc::new(Bridge::new().expect("bridge"));
        let (conn, mut peer) = Connection::pipe();
        let client = SyncClient::with_client(Arc::clone(&bridge), RpcClient::new(conn));

        let host = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("host runtime");
            rt.block_on(async move {
                let call = peer.recv_value().await.expect("spawn call");
                assert_eq!(call["method"], "processSpawn");
                let stdout_id = call["params"]["stdoutStreamId"].as_u64().expect("stdout id");
                let id = call["id"].as_u64().expect("id");
                peer.respond_ok(id, json!({ "pid": 5 })).await;

                // Output first, then let the wait call resolve.
                peer.send_value(json!({
                    "method": "streamChunk",
                    "params": {
                        "streamId": stdout_id,
                        "data": tether_proto::encode_chunk(b"done\n"),
                    },
                }))
                .await;
                peer.send_value(json!({
                    "method": "streamEnd",
                    "params": { "streamId": stdout_id },
                }))
                .await;

                let wait = peer.recv_value().await.expect("wait call");
                assert_eq!(wait["method"], "processWait");
                let wait_id = wait["id"].as_u64().expect("id");
                peer.respond_ok(wait_id, json!({ "success": true, "exitCode": 0 }))
                    .await;
            });
        });

        let mut proc = client
            .spawn(
                Command::new("true")
                    .stdin(Stdio::Null)
                    .stderr(Stdio::Null),
            )
            .expect("spawn");
        assert_eq!(proc.pid(), 5);

        let mut out = Vec::new();
        loop {
            let chunk = proc.read_stdout(1024).expect("read stdout");
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        assert_eq!(out, b"done\n");

        let status = proc.wait().expect("wait");
        assert!(status.success);
        host.join().expect("host");
        client.close();
    }
}
