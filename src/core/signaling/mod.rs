pub mod multiplexer;
pub mod protocol;
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use multiplexer::{MatchMode, Multiplexer, SignalingClient, DEFAULT_REQUEST_TIMEOUT};
pub use protocol::{ClientMessage, MessageKind, ServerEnvelope, ServerMessage};
pub use socket::{memory_pair, MemoryPeer, MemorySocket, SignalingSocket, WebSocketSignaling};

use super::media::TokenSource;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("no {expected} reply within {after:?}")]
    Timeout {
        expected: MessageKind,
        after: Duration,
    },
    #[error("signaling connection is closed")]
    Closed,
    #[error("too many outstanding signaling requests (max {0})")]
    TooManyPending(usize),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unexpected {0} reply")]
    UnexpectedReply(MessageKind),
    #[error("{0}")]
    Socket(String),
}

#[async_trait]
impl TokenSource for SignalingClient {
    async fn fetch_token(
        &self,
        uid: &str,
        channel_name: &str,
        token_role: u32,
    ) -> Result<String, SignalingError> {
        self.agora_token(uid, channel_name, token_role).await
    }
}
