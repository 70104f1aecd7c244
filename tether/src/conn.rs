//! The persistent bidirectional message connection.
//!
//! A [`Connection`] is a pair of bounded channels pumped by a transport
//! driver task: outgoing texts go to the socket, incoming text frames
//! come back, one JSON object per frame. The RPC listener observes the
//! driver dropping the incoming sender as end-of-connection — there is
//! no reconnect; a session lives and dies with its socket.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use crate::error::{Error, Result};

/// Channel depth for each direction.
const CHANNEL_DEPTH: usize = 64;

/// Header carrying the base64-encoded session configuration blob.
const CONFIG_HEADER: &str = "x-tether-config";

/// One persistent, ordered, message-framed connection to the host.
#[derive(Debug)]
pub struct Connection {
    pub(crate) outgoing: mpsc::Sender<String>,
    pub(crate) incoming: mpsc::Receiver<String>,
}

impl Connection {
    /// Opens a WebSocket connection authenticated by a bearer token and
    /// a base64 configuration blob, and starts its driver task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn websocket(url: &str, token: &str, config_b64: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Transport(format!("invalid endpoint url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::Transport(format!("invalid token: {e}")))?;
        let config = HeaderValue::from_str(config_b64)
            .map_err(|e| Error::Transport(format!("invalid config blob: {e}")))?;
        request.headers_mut().insert("authorization", auth);
        request.headers_mut().insert(CONFIG_HEADER, config);

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;
        let (sink, source) = socket.split();

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(drive(sink, source, out_rx, in_tx));

        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }

    /// Creates an in-memory connection and the matching [`Peer`]
    /// endpoint. No driver task is involved; what the client sends the
    /// peer receives and vice versa. Intended for tests and embedders
    /// with custom transports.
    pub fn pipe() -> (Self, Peer) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self {
                outgoing: out_tx,
                incoming: in_rx,
            },
            Peer {
                incoming: out_rx,
                outgoing: in_tx,
            },
        )
    }
}

/// Pumps messages between the socket halves and the channel pair.
///
/// Ends when the socket errors or closes, when the client side goes
/// away, or when the listener stops reading. Dropping `in_tx` on return
/// is what signals connection loss upstream.
async fn drive<W, R, E>(
    mut sink: W,
    mut source: R,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<String>,
) where
    W: Sink<WsMessage> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            debug!("websocket send failed, closing connection");
                            break;
                        }
                    }
                    None => {
                        // Client dropped; tell the host we are done.
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("websocket closed by host");
                        break;
                    }
                    // The wire is text; ping/pong are handled by the
                    // library and binary frames have no meaning here.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("websocket read error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// The far end of a [`Connection::pipe`]: receives what the client
/// sends and can inject host messages.
#[derive(Debug)]
pub struct Peer {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
}

impl Peer {
    /// Receives the next client message, or `None` once the client side
    /// is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Receives the next client message parsed as JSON.
    pub async fn recv_value(&mut self) -> Option<serde_json::Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Receives an already-queued client message without waiting.
    pub fn try_recv_value(&mut self) -> Option<serde_json::Value> {
        let text = self.incoming.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Sends a raw text message to the client.
    pub async fn send(&self, text: String) {
        let _ = self.outgoing.send(text).await;
    }

    /// Sends a JSON value to the client.
    pub async fn send_value(&self, value: serde_json::Value) {
        self.send(value.to_string()).await;
    }

    /// Sends a successful response envelope for `id`.
    pub async fn respond_ok(&self, id: u64, ok: serde_json::Value) {
        self.send_value(serde_json::json!({ "id": id, "result": { "ok": ok } }))
            .await;
    }

    /// Sends a top-level error response for `id`.
    pub async fn respond_err(&self, id: u64, message: &str, data: serde_json::Value) {
        self.send_value(serde_json::json!({
            "id": id,
            "error": { "message": message, "data": data },
        }))
        .await;
    }

    /// Drops both directions, simulating connection loss.
    pub fn close(self) {}
}
