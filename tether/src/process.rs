//! Remote process spawning and lifecycle.
//!
//! A [`Command`] allocates output streams *before* the spawn call goes
//! out, so the host can start pushing stdout/stderr the moment the
//! process exists. The returned [`ProcessHandle`] owns a background
//! wait call whose result is cached: every `wait()` and `status()`
//! observer sees the same terminal outcome.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use tether_proto::methods;

use crate::error::{Error, Result};
use crate::lock;
use crate::rpc::RpcClient;
use crate::stream::StreamReader;

/// What to do with one standard stream of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stdio {
    /// Buffer it for the caller (stdout/stderr) or accept writes (stdin).
    #[default]
    Piped,
    /// Copy it to this process's own stdout/stderr as it arrives.
    /// Meaningless for stdin, where it behaves like [`Stdio::Null`].
    Inherit,
    /// Discard it; no stream is allocated.
    Null,
}

/// How a remote process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExitStatus {
    /// Whether the host considered the exit clean.
    pub success: bool,
    /// Exit code, absent when the process died to a signal.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Terminating signal number, when there was one.
    #[serde(default)]
    pub signal: Option<i32>,
}

/// Builder for a remote process.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<String>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
}

impl Command {
    /// Starts a builder for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: Stdio::Piped,
            stdout: Stdio::Piped,
            stderr: Stdio::Piped,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable for the remote process.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Sets the remote working directory.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Configures stdin. [`Stdio::Inherit`] is treated as [`Stdio::Null`].
    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    /// Configures stdout.
    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    /// Configures stderr.
    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// Spawns the process on the host.
    ///
    /// Output buffers are registered before the spawn call discloses
    /// their ids, so output produced immediately after process start is
    /// never lost. If the spawn is rejected the registrations are torn
    /// down again.
    pub async fn spawn(self, client: &RpcClient) -> Result<ProcessHandle> {
        let stdout = match self.stdout {
            Stdio::Null => None,
            _ => Some(client.open_stream()),
        };
        let stderr = match self.stderr {
            Stdio::Null => None,
            _ => Some(client.open_stream()),
        };
        let stdin_id = match self.stdin {
            Stdio::Piped => Some(client.alloc_stream_id()),
            _ => None,
        };

        // Environment entries travel as {name, value} pairs: the case
        // boundary rewrites object keys, and variable names like
        // LD_LIBRARY_PATH must arrive untouched.
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut params = serde_json::Map::new();
        params.insert("cmd".into(), json!(self.program));
        params.insert("args".into(), json!(self.args));
        if !env.is_empty() {
            params.insert("env".into(), Value::Array(env));
        }
        if let Some(cwd) = &self.cwd {
            params.insert("cwd".into(), json!(cwd));
        }
        if let Some((id, _)) = &stdout {
            params.insert("stdout_stream_id".into(), json!(id));
        }
        if let Some((id, _)) = &stderr {
            params.insert("stderr_stream_id".into(), json!(id));
        }
        if let Some(id) = stdin_id {
            params.insert("stdin_stream_id".into(), json!(id));
        }

        let outcome = client
            .call(methods::PROCESS_SPAWN, Value::Object(params))
            .await
            .and_then(|value| {
                value.get("pid").and_then(Value::as_u64).ok_or_else(|| {
                    Error::Transport("malformed processSpawn result: missing pid".to_owned())
                })
            });
        let pid = match outcome {
            Ok(pid) => pid,
            Err(e) => {
                if let Some((id, _)) = &stdout {
                    client.discard_stream(*id);
                }
                if let Some((id, _)) = &stderr {
                    client.discard_stream(*id);
                }
                return Err(e);
            }
        };

        // The process exists; announce its stdin stream.
        if let Some(id) = stdin_id {
            client
                .notify_stream(methods::STREAM_START, id, None, None)
                .await?;
        }

        let mut tasks = Vec::new();
        let (status_tx, status_rx) = watch::channel(None);
        let wait_client = client.clone();
        tasks.push(tokio::spawn(async move {
            let result = wait_client
                .call(methods::PROCESS_WAIT, json!({ "pid": pid }))
                .await
                .and_then(|value| {
                    serde_json::from_value::<ExitStatus>(value).map_err(|e| {
                        Error::Transport(format!("malformed processWait result: {e}"))
                    })
                });
            let _ = status_tx.send(Some(result));
        }));

        let stdout = finish_output(self.stdout, stdout, &mut tasks, tokio::io::stdout);
        let stderr = finish_output(self.stderr, stderr, &mut tasks, tokio::io::stderr);

        Ok(ProcessHandle {
            inner: Arc::new(ProcessInner {
                pid,
                client: client.clone(),
                status: status_rx,
                stdout: Mutex::new(stdout),
                stderr: Mutex::new(stderr),
                stdin: Mutex::new(stdin_id),
                tasks: Mutex::new(tasks),
            }),
        })
    }
}

/// Keeps a piped reader, or turns an inherited one into a pump task.
fn finish_output<W>(
    mode: Stdio,
    opened: Option<(u64, StreamReader)>,
    tasks: &mut Vec<JoinHandle<()>>,
    sink: fn() -> W,
) -> Option<StreamReader>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match (mode, opened) {
        (Stdio::Inherit, Some((_, reader))) => {
            tasks.push(tokio::spawn(pump_inherit(reader, sink())));
            None
        }
        (_, Some((_, reader))) => Some(reader),
        (_, None) => None,
    }
}

/// Copies a stream buffer to a local sink until it terminates. Uses
/// the any-bytes read so output is echoed as it arrives, not once a
/// fixed buffer fills.
async fn pump_inherit<W: AsyncWrite + Unpin>(mut reader: StreamReader, mut sink: W) {
    loop {
        match reader.next_chunk().await {
            Ok(bytes) if bytes.is_empty() => break,
            Ok(bytes) => {
                if let Err(e) = sink.write_all(&bytes).await {
                    warn!("inherited output write failed: {e}");
                    break;
                }
                let _ = sink.flush().await;
            }
            Err(e) => {
                warn!("inherited output stream failed: {e}");
                break;
            }
        }
    }
}

/// Handle to a running (or exited) remote process.
///
/// Clones share the process; background tasks stop when the last clone
/// drops.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

#[derive(Debug)]
struct ProcessInner {
    pid: u64,
    client: RpcClient,
    status: watch::Receiver<Option<Result<ExitStatus>>>,
    stdout: Mutex<Option<StreamReader>>,
    stderr: Mutex<Option<StreamReader>>,
    stdin: Mutex<Option<u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl ProcessHandle {
    /// Host-assigned process id.
    pub fn pid(&self) -> u64 {
        self.inner.pid
    }

    /// Waits for the process to exit.
    ///
    /// The outcome is cached; concurrent and repeated waits all observe
    /// the same result. Connection loss before exit surfaces as
    /// [`Error::Transport`].
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut status = self.inner.status.clone();
        let observed = status
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Transport("connection closed".to_owned()))?;
        match observed.as_ref() {
            Some(result) => result.clone(),
            None => Err(Error::Transport("connection closed".to_owned())),
        }
    }

    /// The cached exit outcome, without blocking. `None` while running.
    pub fn status(&self) -> Option<Result<ExitStatus>> {
        self.inner.status.borrow().clone()
    }

    /// Kills the process. Losing the race against a natural exit is
    /// fine: the host's already-exited error is swallowed.
    pub async fn kill(&self) -> Result<()> {
        let call = self
            .inner
            .client
            .call(methods::PROCESS_KILL, json!({ "pid": self.inner.pid }))
            .await;
        match call {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exited() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sends an arbitrary signal. Unlike [`kill`](Self::kill), losing
    /// the exit race is surfaced to the caller.
    pub async fn signal(&self, signal: i32) -> Result<()> {
        self.inner
            .client
            .call(
                methods::PROCESS_SIGNAL,
                json!({ "pid": self.inner.pid, "signal": signal }),
            )
            .await
            .map(drop)
    }

    /// Takes the stdout reader. `None` unless stdout was piped (or on
    /// the second take).
    pub fn take_stdout(&self) -> Option<StreamReader> {
        lock(&self.inner.stdout).take()
    }

    /// Takes the stderr reader.
    pub fn take_stderr(&self) -> Option<StreamReader> {
        lock(&self.inner.stderr).take()
    }

    /// Writes bytes to the process's stdin stream.
    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        let Some(stream_id) = *lock(&self.inner.stdin) else {
            return Err(Error::Transport("stdin is not open".to_owned()));
        };
        self.inner.client.send_chunk(stream_id, bytes).await
    }

    /// Closes stdin, signalling end-of-input to the process. Idempotent.
    pub async fn close_stdin(&self) -> Result<()> {
        let Some(stream_id) = lock(&self.inner.stdin).take() else {
            return Ok(());
        };
        self.inner
            .client
            .notify_stream(methods::STREAM_END, stream_id, None, None)
            .await
    }

    /// Detaches from the process: closes stdin, drops unread output and
    /// stops the background tasks. The process itself keeps running.
    pub async fn close(&self) {
        let _ = self.close_stdin().await;
        lock(&self.inner.stdout).take();
        lock(&self.inner.stderr).take();
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Connection, Peer};

    fn client_pair() -> (RpcClient, Peer) {
        let (conn, peer) = Connection::pipe();
        (RpcClient::new(conn), peer)
    }

    #[tokio::test]
    async fn spawn_pipes_output_and_caches_exit() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            assert_eq!(call["method"], "processSpawn");
            assert_eq!(call["params"]["cmd"], "cat");
            let stdout_id = call["params"]["stdoutStreamId"].as_u64().expect("stdout id");
            let stdin_id = call["params"]["stdinStreamId"].as_u64().expect("stdin id");
            let id = call["id"].as_u64().expect("id");
            peer.respond_ok(id, json!({ "pid": 42 })).await;

            let start = peer.recv_value().await.expect("stdin start");
            assert_eq!(start["method"], "streamStart");
            assert_eq!(start["params"]["streamId"].as_u64(), Some(stdin_id));

            // Remaining client messages can interleave: the wait call
            // races the caller's stdin writes.
            let mut wait_id = None;
            let mut stdin_done = false;
            while !(stdin_done && wait_id.is_some()) {
                let msg = peer.recv_value().await.expect("message");
                match msg["method"].as_str() {
                    Some("processWait") => {
                        assert_eq!(msg["params"]["pid"], 42);
                        wait_id = msg["id"].as_u64();
                    }
                    Some("streamChunk") => {
                        // cat: echo stdin back on stdout.
                        assert_eq!(msg["params"]["streamId"].as_u64(), Some(stdin_id));
                        peer.send_value(json!({
                            "method": "streamChunk",
                            "params": { "streamId": stdout_id, "data": msg["params"]["data"] },
                        }))
                        .await;
                    }
                    Some("streamEnd") => {
                        peer.send_value(json!({
                            "method": "streamEnd",
                            "params": { "streamId": stdout_id },
                        }))
                        .await;
                        stdin_done = true;
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
            peer.respond_ok(wait_id.expect("wait id"), json!({ "success": true, "exitCode": 0 }))
                .await;
            peer
        });

        let proc = Command::new("cat").spawn(&client).await.expect("spawn");
        assert_eq!(proc.pid(), 42);
        assert!(proc.status().is_none());

        let mut stdout = proc.take_stdout().expect("piped stdout");
        assert!(proc.take_stdout().is_none(), "reader can be taken once");

        proc.write_stdin(b"ping").await.expect("write stdin");
        proc.close_stdin().await.expect("close stdin");
        assert_eq!(stdout.read_to_end().await.expect("stdout"), b"ping");

        let status = proc.wait().await.expect("wait");
        assert!(status.success);
        assert_eq!(status.exit_code, Some(0));

        // Cached: a second wait and status() agree without a new call.
        let again = proc.wait().await.expect("second wait");
        assert_eq!(again, status);
        assert_eq!(proc.status().expect("cached").expect("ok"), status);
        host.await.expect("host");
    }

    #[tokio::test]
    async fn kill_swallows_already_exited() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            assert!(call["params"].get("stdoutStreamId").is_none());
            assert!(call["params"].get("stdinStreamId").is_none());
            let id = call["id"].as_u64().expect("id");
            peer.respond_ok(id, json!({ "pid": 7 })).await;

            // Accept wait and kill in either order; only kill is answered.
            loop {
                let msg = peer.recv_value().await.expect("message");
                if msg["method"] == "processKill" {
                    assert_eq!(msg["params"]["pid"], 7);
                    let id = msg["id"].as_u64().expect("id");
                    peer.send_value(json!({
                        "id": id,
                        "result": { "error": { "code": "AlreadyExitedError", "message": "gone" } },
                    }))
                    .await;
                    break;
                }
                assert_eq!(msg["method"], "processWait");
            }
            peer
        });

        let proc = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::Null)
            .stdout(Stdio::Null)
            .stderr(Stdio::Null)
            .spawn(&client)
            .await
            .expect("spawn");
        proc.kill().await.expect("already-exited is not an error");
        host.await.expect("host");
    }

    #[tokio::test]
    async fn signal_death_is_reported_in_the_status() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            let id = call["id"].as_u64().expect("id");
            peer.respond_ok(id, json!({ "pid": 9 })).await;
            let wait = peer.recv_value().await.expect("wait call");
            let wait_id = wait["id"].as_u64().expect("id");
            peer.respond_ok(
                wait_id,
                json!({ "success": false, "exitCode": null, "signal": 9 }),
            )
            .await;
        });

        let proc = Command::new("victim")
            .stdin(Stdio::Null)
            .stdout(Stdio::Null)
            .stderr(Stdio::Null)
            .spawn(&client)
            .await
            .expect("spawn");
        let status = proc.wait().await.expect("wait");
        assert!(!status.success);
        assert_eq!(status.exit_code, None);
        assert_eq!(status.signal, Some(9));
        host.await.expect("host");
    }

    #[tokio::test]
    async fn rejected_spawn_discards_stream_registrations() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            let id = call["id"].as_u64().expect("id");
            peer.respond_err(id, "no such binary", json!({ "name": "NotFoundError" }))
                .await;
            peer
        });

        let err = Command::new("missing")
            .spawn(&client)
            .await
            .expect_err("spawn fails");
        assert!(matches!(err, Error::Remote { tag, .. } if tag == "NotFoundError"));
        assert_eq!(client.registered_streams(), 0);
        host.await.expect("host");
    }

    #[tokio::test]
    async fn inherited_output_is_echoed_as_it_arrives() {
        use tokio::io::AsyncReadExt;

        let table = crate::stream::StreamTable::default();
        let reader = table.register(1);
        let (sink, mut echo) = tokio::io::duplex(1024);
        let pump = tokio::spawn(pump_inherit(reader, sink));

        table.feed(1, b"early".to_vec());

        // A five-byte chunk must reach the sink while the stream is
        // still open.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            echo.read(&mut buf),
        )
        .await
        .expect("echoed before end-of-stream")
        .expect("read");
        assert_eq!(&buf[..n], b"early");

        table.end(1);
        pump.await.expect("pump");
        assert_eq!(echo.read(&mut buf).await.expect("eof"), 0);
    }

    #[tokio::test]
    async fn inherit_mode_hands_the_reader_to_the_pump() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            // An inherited stream still gets an id on the wire.
            assert!(call["params"]["stdoutStreamId"].is_u64());
            assert!(call["params"].get("stderrStreamId").is_none());
            let id = call["id"].as_u64().expect("id");
            peer.respond_ok(id, json!({ "pid": 11 })).await;
            peer
        });

        let proc = Command::new("logger")
            .stdin(Stdio::Null)
            .stdout(Stdio::Inherit)
            .stderr(Stdio::Null)
            .spawn(&client)
            .await
            .expect("spawn");
        // The pump owns the stdout reader; there is nothing to take.
        assert!(proc.take_stdout().is_none());
        host.await.expect("host");
    }

    #[tokio::test]
    async fn env_travels_as_name_value_pairs() {
        let (client, mut peer) = client_pair();

        let host = tokio::spawn(async move {
            let call = peer.recv_value().await.expect("spawn call");
            let env = call["params"]["env"].as_array().expect("env").clone();
            assert_eq!(env[0]["name"], "LD_LIBRARY_PATH");
            assert_eq!(env[0]["value"], "/opt/lib");
            assert_eq!(call["params"]["cwd"], "/work");
            let id = call["id"].as_u64().expect("id");
            peer.respond_ok(id, json!({ "pid": 3 })).await;
        });

        Command::new("env")
            .env("LD_LIBRARY_PATH", "/opt/lib")
            .cwd("/work")
            .stdin(Stdio::Null)
            .stdout(Stdio::Null)
            .stderr(Stdio::Null)
            .spawn(&client)
            .await
            .expect("spawn");
        host.await.expect("host");
    }
}
