use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    AudioEngine, DecodedClip, EngineEvent, JoinParams, ParticipantId, SourceEnded, SourceId,
    Transport, TransportError, TransportKind,
};
use crate::core::spatial::AudioPosition;

/// Tokenless transport for single-process sessions.
#[derive(Debug, Default)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn generate_unique_id(&self) -> ParticipantId {
        format!("{:08x}", rand::random::<u32>())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceStart {
    pub id: SourceId,
    pub at: Instant,
}

struct EngineState {
    joined: Option<JoinParams>,
    credentials: Option<String>,
    leaves: usize,
    listener: Option<AudioPosition>,
    clips: HashMap<SourceId, Arc<DecodedClip>>,
    playing: HashMap<SourceId, JoinHandle<()>>,
    source_positions: HashMap<String, (f32, f32)>,
    polar_positions: HashMap<String, (f32, f32)>,
    broadcasts: Vec<Bytes>,
    videos: Vec<(String, String)>,
    starts: Vec<SourceStart>,
    muted: bool,
    aec_enabled: bool,
    noise_suppression_enabled: bool,
    threshold_db: f32,
    next_source: u64,
    join_delay: Duration,
    fail_joins: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            joined: None,
            credentials: None,
            leaves: 0,
            listener: None,
            clips: HashMap::new(),
            playing: HashMap::new(),
            source_positions: HashMap::new(),
            polar_positions: HashMap::new(),
            broadcasts: Vec::new(),
            videos: Vec::new(),
            starts: Vec::new(),
            muted: false,
            aec_enabled: false,
            noise_suppression_enabled: true,
            threshold_db: -40.0,
            next_source: 0,
            join_delay: Duration::ZERO,
            fail_joins: false,
        }
    }
}

impl EngineState {
    fn stop_all_sources(&mut self) {
        for (_, handle) in self.playing.drain() {
            handle.abort();
        }
        self.clips.clear();
    }
}

/// Engine without device I/O. Local sources "play" for their clip duration
/// on the tokio clock, which makes the scheduler testable with paused time.
/// Remote traffic is injected through [`HeadlessEngine::emit`].
#[derive(Default)]
pub struct HeadlessEngine {
    state: Mutex<EngineState>,
    events: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an event to the current subscriber as if it came from a
    /// remote peer. Returns `false` when nobody is listening.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn set_join_delay(&self, delay: Duration) {
        lock(&self.state).join_delay = delay;
    }

    pub fn fail_joins(&self, fail: bool) {
        lock(&self.state).fail_joins = fail;
    }

    pub fn joined(&self) -> Option<JoinParams> {
        lock(&self.state).joined.clone()
    }

    pub fn credentials(&self) -> Option<String> {
        lock(&self.state).credentials.clone()
    }

    pub fn leave_count(&self) -> usize {
        lock(&self.state).leaves
    }

    pub fn listener_position(&self) -> Option<AudioPosition> {
        lock(&self.state).listener
    }

    pub fn source_position(&self, id: &str) -> Option<(f32, f32)> {
        lock(&self.state).source_positions.get(id).copied()
    }

    pub fn polar_position(&self, id: &str) -> Option<(f32, f32)> {
        lock(&self.state).polar_positions.get(id).copied()
    }

    pub fn broadcasts(&self) -> Vec<Bytes> {
        lock(&self.state).broadcasts.clone()
    }

    pub fn videos(&self) -> Vec<(String, String)> {
        lock(&self.state).videos.clone()
    }

    pub fn source_starts(&self) -> Vec<SourceStart> {
        lock(&self.state).starts.clone()
    }

    pub fn live_sources(&self) -> usize {
        lock(&self.state).clips.len()
    }

    pub fn threshold(&self) -> f32 {
        lock(&self.state).threshold_db
    }
}

#[async_trait]
impl AudioEngine for HeadlessEngine {
    async fn join(
        &self,
        transport: Arc<dyn Transport>,
        params: JoinParams,
    ) -> Result<(), TransportError> {
        let credentials = transport
            .credentials(&params.participant_id, &params.channel)
            .await?;

        let (delay, fail) = {
            let state = lock(&self.state);
            (state.join_delay, state.fail_joins)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransportError::Join(format!(
                "{} refused channel {}",
                transport.kind(),
                params.channel
            )));
        }

        log::info!(
            "headless engine joined {} as {} over {}",
            params.channel,
            params.participant_id,
            transport.kind()
        );
        let mut state = lock(&self.state);
        state.listener = Some(params.position);
        state.threshold_db = params.noise_gate_threshold;
        state.credentials = credentials;
        state.joined = Some(params);
        Ok(())
    }

    async fn leave(&self, will_restart: bool) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if let Some(params) = state.joined.take() {
            log::info!(
                "headless engine left {} (restart: {will_restart})",
                params.channel
            );
        }
        state.leaves += 1;
        state.credentials = None;
        state.stop_all_sources();
        state.source_positions.clear();
        state.polar_positions.clear();
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        rx
    }

    fn set_listener_position(&self, position: AudioPosition) {
        lock(&self.state).listener = Some(position);
    }

    fn set_source_position(&self, id: &str, x: f32, y: f32) {
        lock(&self.state)
            .source_positions
            .insert(id.to_string(), (x, y));
    }

    fn set_polar_source_position(&self, id: &str, azimuth: f32, distance: f32) {
        lock(&self.state)
            .polar_positions
            .insert(id.to_string(), (azimuth, distance));
    }

    fn send_broadcast(&self, payload: Bytes) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.joined.is_none() {
            return Err(TransportError::Broadcast("not in a room".to_string()));
        }
        state.broadcasts.push(payload);
        Ok(())
    }

    fn add_local_source(&self, clip: Arc<DecodedClip>) -> Result<SourceId, TransportError> {
        if clip.samples.is_empty() {
            return Err(TransportError::Source(format!("{} has no samples", clip.label)));
        }
        let mut state = lock(&self.state);
        state.next_source += 1;
        let id = format!("local-{}", state.next_source);
        state.clips.insert(id.clone(), clip);
        Ok(id)
    }

    fn start_sources(&self, ids: &[SourceId]) -> Vec<SourceEnded> {
        let mut state = lock(&self.state);
        let now = Instant::now();
        let mut ended = Vec::with_capacity(ids.len());

        for id in ids {
            let (done_tx, done_rx) = oneshot::channel();
            ended.push(done_rx);

            // Unknown ids end immediately: the sender is dropped here.
            let Some(clip) = state.clips.get(id).cloned() else {
                continue;
            };
            let length = clip.duration();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(length).await;
                let _ = done_tx.send(());
            });
            if let Some(previous) = state.playing.insert(id.clone(), handle) {
                previous.abort();
            }
            state.starts.push(SourceStart {
                id: id.clone(),
                at: now,
            });
        }
        ended
    }

    fn stop_source(&self, id: &str) {
        let mut state = lock(&self.state);
        if let Some(handle) = state.playing.remove(id) {
            handle.abort();
        }
        state.clips.remove(id);
        state.source_positions.remove(id);
    }

    fn set_muted(&self, muted: bool) {
        lock(&self.state).muted = muted;
    }

    fn is_muted(&self) -> bool {
        lock(&self.state).muted
    }

    fn set_aec_enabled(&self, enabled: bool) {
        lock(&self.state).aec_enabled = enabled;
    }

    fn is_aec_enabled(&self) -> bool {
        lock(&self.state).aec_enabled
    }

    fn set_noise_suppression_enabled(&self, enabled: bool) {
        lock(&self.state).noise_suppression_enabled = enabled;
    }

    fn is_noise_suppression_enabled(&self) -> bool {
        lock(&self.state).noise_suppression_enabled
    }

    fn set_threshold(&self, threshold_db: f32) {
        lock(&self.state).threshold_db = threshold_db;
    }

    fn play_video(&self, id: &str, target: &str) {
        lock(&self.state)
            .videos
            .push((id.to_string(), target.to_string()));
    }
}
