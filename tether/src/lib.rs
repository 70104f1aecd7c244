//! Client for a remote command-execution host.
//!
//! `tether` speaks to the host over one persistent, ordered,
//! message-framed connection (WebSocket by default) that multiplexes
//! concurrent id-correlated calls with unsolicited stream notifications
//! carrying process output and file contents. On top of that sit a
//! chunked uploader, a process handle with independent stdout/stderr
//! readers, and a blocking facade for callers without an async runtime.
//!
//! # Quick start — run a command
//!
//! ```no_run
//! use tether::{Command, Connection, RpcClient, Stdio};
//!
//! # async fn run() -> tether::Result<()> {
//! let conn = Connection::websocket("wss://host.example/session", "token", "e30=").await?;
//! let client = RpcClient::new(conn);
//!
//! let mut proc = Command::new("echo")
//!     .arg("hello")
//!     .stdout(Stdio::Piped)
//!     .spawn(&client)
//!     .await?;
//!
//! let mut stdout = proc.take_stdout().expect("piped");
//! let status = proc.wait().await?;
//! println!("{} -> {status:?}", String::from_utf8_lossy(&stdout.read_to_end().await?));
//! # Ok(())
//! # }
//! ```
//!
//! Blocking callers use [`SyncClient`] instead; it owns a background
//! worker thread running the same async client.

mod bridge;
mod conn;
mod error;
mod fs;
mod process;
mod rpc;
mod stream;
mod upload;

pub use bridge::{Bridge, SyncClient, SyncProcess};
pub use conn::{Connection, Peer};
pub use error::{Error, FieldIssue, Result};
pub use fs::ReadOptions;
pub use process::{Command, ExitStatus, ProcessHandle, Stdio};
pub use rpc::RpcClient;
pub use stream::StreamReader;
pub use upload::{ByteSource, DEFAULT_CHUNK_SIZE};

/// Locks a mutex, recovering the data if a holder panicked. None of the
/// guarded structures can be left torn by a panic mid-update.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
