pub mod headless;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::signaling::SignalingError;
use super::spatial::AudioPosition;

pub use headless::{HeadlessEngine, LoopbackTransport, SourceStart};

pub type ParticipantId = String;
pub type SourceId = String;

/// Resolves when a local source finishes playing or is stopped. A dropped
/// sender counts as finished.
pub type SourceEnded = oneshot::Receiver<()>;

pub const CLIP_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    P2p,
    Agora,
    Loopback,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::P2p => "p2p",
            TransportKind::Agora => "agora",
            TransportKind::Loopback => "loopback",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Carries structured per-participant position data alongside audio.
    pub position_metadata: bool,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} transport is not available in this build")]
    Unavailable(TransportKind),
    #[error("join failed: {0}")]
    Join(String),
    #[error("leave failed: {0}")]
    Leave(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("failed to add local source: {0}")]
    Source(String),
    #[error("token request failed: {0}")]
    Token(#[from] SignalingError),
}

/// Hands out short-lived credentials for hosted transports.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(
        &self,
        uid: &str,
        channel_name: &str,
        token_role: u32,
    ) -> Result<String, SignalingError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn generate_unique_id(&self) -> ParticipantId;

    /// Credentials the engine presents when joining `channel`. Hosted
    /// providers fetch a token here; tokenless transports return `None`.
    async fn credentials(
        &self,
        _participant_id: &str,
        _channel: &str,
    ) -> Result<Option<String>, TransportError> {
        Ok(None)
    }
}

pub trait TransportFactory: Send + Sync {
    /// Must not touch the network or allocate anything.
    fn capabilities(&self, kind: TransportKind) -> Option<TransportCapabilities>;

    fn create(
        &self,
        kind: TransportKind,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

type TransportBuilder = Box<dyn Fn(Arc<dyn TokenSource>) -> Arc<dyn Transport> + Send + Sync>;

/// Transports known to this process. The loopback transport is always
/// present; hosts register SDK-backed ones.
pub struct TransportRegistry {
    builders: HashMap<TransportKind, (TransportCapabilities, TransportBuilder)>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register(
            TransportKind::Loopback,
            TransportCapabilities {
                position_metadata: true,
            },
            |_tokens| Arc::new(LoopbackTransport::new()) as Arc<dyn Transport>,
        );
        registry
    }

    pub fn register<F>(&mut self, kind: TransportKind, capabilities: TransportCapabilities, builder: F)
    where
        F: Fn(Arc<dyn TokenSource>) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        self.builders.insert(kind, (capabilities, Box::new(builder)));
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for TransportRegistry {
    fn capabilities(&self, kind: TransportKind) -> Option<TransportCapabilities> {
        self.builders.get(&kind).map(|(capabilities, _)| *capabilities)
    }

    fn create(
        &self,
        kind: TransportKind,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let (_, builder) = self
            .builders
            .get(&kind)
            .ok_or(TransportError::Unavailable(kind))?;
        Ok(builder(tokens))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinParams {
    pub participant_id: ParticipantId,
    pub channel: String,
    pub position: AudioPosition,
    pub noise_gate_threshold: f32,
    pub video: bool,
    pub metadata: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RemotePositionUpdated {
        id: ParticipantId,
        x: f32,
        y: f32,
        o: f32,
    },
    BroadcastReceived {
        id: ParticipantId,
        payload: Bytes,
    },
    RemoteVolumeUpdated {
        id: ParticipantId,
        level: f32,
    },
    RemoteSourceConnected {
        id: ParticipantId,
    },
    RemoteSourceDisconnected {
        id: ParticipantId,
    },
    Error {
        message: String,
    },
}

/// Mono 48 kHz PCM ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub label: String,
    pub samples: Vec<f32>,
}

impl DecodedClip {
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / CLIP_SAMPLE_RATE as u64)
    }
}

/// The spatial audio engine: mixing, spatialization and device I/O live
/// behind this.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    async fn join(
        &self,
        transport: Arc<dyn Transport>,
        params: JoinParams,
    ) -> Result<(), TransportError>;

    async fn leave(&self, will_restart: bool) -> Result<(), TransportError>;

    /// Replaces any previous subscriber.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent>;

    fn set_listener_position(&self, position: AudioPosition);

    fn set_source_position(&self, id: &str, x: f32, y: f32);

    fn set_polar_source_position(&self, id: &str, azimuth: f32, distance: f32);

    fn send_broadcast(&self, payload: Bytes) -> Result<(), TransportError>;

    fn add_local_source(&self, clip: Arc<DecodedClip>) -> Result<SourceId, TransportError>;

    /// Starts every listed source in the same engine tick.
    fn start_sources(&self, ids: &[SourceId]) -> Vec<SourceEnded>;

    fn stop_source(&self, id: &str);

    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;

    fn set_aec_enabled(&self, enabled: bool);
    fn is_aec_enabled(&self) -> bool;

    fn set_noise_suppression_enabled(&self, enabled: bool);
    fn is_noise_suppression_enabled(&self) -> bool;

    fn set_threshold(&self, threshold_db: f32);

    fn play_video(&self, id: &str, target: &str);
}
