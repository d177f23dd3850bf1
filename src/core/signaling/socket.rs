use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::SignalingError;

/// One ordered, reliable, text-frame connection to the signaling server.
/// Only the multiplexer loop holds it.
#[async_trait]
pub trait SignalingSocket: Send + 'static {
    async fn send(&mut self, text: String) -> Result<(), SignalingError>;

    /// `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<String, SignalingError>>;

    async fn close(&mut self) -> Result<(), SignalingError>;
}

pub struct WebSocketSignaling {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketSignaling {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| SignalingError::Socket(format!("failed to connect {url}: {err}")))?;
        Ok(Self { ws })
    }
}

#[async_trait]
impl SignalingSocket for WebSocketSignaling {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Socket(format!("websocket send failed: {err}")))
    }

    async fn recv(&mut self) -> Option<Result<String, SignalingError>> {
        while let Some(frame) = self.ws.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    return Some(Err(SignalingError::Socket(format!(
                        "websocket receive failed: {err}"
                    ))))
                }
            };
            match frame {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => {
                        log::warn!("dropping non-utf8 signaling frame: {err}");
                        continue;
                    }
                },
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        self.ws
            .close(None)
            .await
            .map_err(|err| SignalingError::Socket(format!("websocket close failed: {err}")))
    }
}

/// In-process socket; the other end is a [`MemoryPeer`] that plays the
/// server.
pub struct MemorySocket {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

pub fn memory_pair() -> (MemorySocket, MemoryPeer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        MemorySocket { inbound, outbound },
        MemoryPeer {
            to_client,
            from_client,
        },
    )
}

impl MemoryPeer {
    pub fn push(&self, raw: impl Into<String>) -> bool {
        self.to_client.send(raw.into()).is_ok()
    }

    pub fn push_json(&self, value: serde_json::Value) -> bool {
        self.push(value.to_string())
    }

    pub async fn next_sent(&mut self) -> Option<serde_json::Value> {
        let raw = self.from_client.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    pub fn try_next_sent(&mut self) -> Option<serde_json::Value> {
        let raw = self.from_client.try_recv().ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[async_trait]
impl SignalingSocket for MemorySocket {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, SignalingError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        self.inbound.close();
        Ok(())
    }
}
