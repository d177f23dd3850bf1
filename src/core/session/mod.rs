pub mod context;

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::ambient::{AmbientScheduler, ClipLoader, StartedSource};
use super::events::{
    emit_controls, emit_players, emit_rooms, emit_scene, ControlsEvent, ElementIcon, RoomView,
    SceneElement, SessionPhase,
};
use super::media::{
    AudioEngine, EngineEvent, JoinParams, TokenSource, TransportError, TransportFactory,
    TransportKind,
};
use super::rooms::{RoomRegistry, RoomSpec};
use super::signaling::{ServerEnvelope, ServerMessage};
use super::spatial::{
    audio_to_canvas, canvas_to_audio, level_to_radius, linear_azimuths, CanvasPoint, MIN_RADIUS,
};

pub use context::{remote_player_target, Broadcast, SessionContext, LOCAL_PLAYER};

/// Distance used for every video participant; only the azimuth varies.
const VIDEO_SOURCE_DISTANCE: f32 = 1.0;
const REMOTE_ALPHA: f32 = 0.5;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room {room} needs per-participant position metadata, which the {transport} transport cannot carry")]
    JoinBlocked {
        room: String,
        transport: TransportKind,
    },
    #[error("unknown room {0}")]
    UnknownRoom(String),
    #[error("already joined")]
    AlreadyJoined,
    #[error("join was cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether repeating the same action could succeed without a config
    /// change.
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::JoinBlocked { .. }
            | SessionError::UnknownRoom(_)
            | SessionError::AlreadyJoined => false,
            SessionError::Transport(TransportError::Unavailable(_)) => false,
            SessionError::Cancelled | SessionError::Transport(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub username: String,
    pub transport: TransportKind,
    pub noise_gate_threshold: f32,
    pub local_sources_enabled: bool,
}

pub struct SessionDeps {
    pub engine: Arc<dyn AudioEngine>,
    pub transports: Arc<dyn TransportFactory>,
    pub tokens: Arc<dyn TokenSource>,
    pub view: Arc<dyn RoomView>,
    pub clips: ClipLoader,
}

/// One element moved on the canvas, in normalized canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasMove {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub o: f32,
}

/// Join/leave/switch state machine. Mutating operations are meant to run
/// from the action queue; engine events and signaling notifications may
/// arrive in between.
pub struct Session {
    rooms: &'static RoomRegistry,
    engine: Arc<dyn AudioEngine>,
    transports: Arc<dyn TransportFactory>,
    tokens: Arc<dyn TokenSource>,
    view: Arc<dyn RoomView>,
    ambient: AmbientScheduler,
    context: RwLock<SessionContext>,
    join_cancel: Mutex<Option<CancellationToken>>,
}

fn lock_cancel(slot: &Mutex<Option<CancellationToken>>) -> MutexGuard<'_, Option<CancellationToken>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    pub fn new(deps: SessionDeps, settings: SessionSettings) -> Self {
        let ambient = AmbientScheduler::new(Arc::clone(&deps.engine), deps.clips);
        Self {
            rooms: RoomRegistry::builtin(),
            engine: deps.engine,
            transports: deps.transports,
            tokens: deps.tokens,
            view: deps.view,
            ambient,
            context: RwLock::new(SessionContext::new(
                settings.username,
                settings.transport,
                settings.noise_gate_threshold,
                settings.local_sources_enabled,
            )),
            join_cancel: Mutex::new(None),
        }
    }

    pub async fn context(&self) -> SessionContext {
        self.context.read().await.clone()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.context.read().await.phase
    }

    pub fn ambient(&self) -> &AmbientScheduler {
        &self.ambient
    }

    pub async fn set_channel_prefix(&self, prefix: String) {
        self.context.write().await.channel_prefix = prefix;
    }

    pub async fn join(&self) -> Result<(), SessionError> {
        let (room, params, transport, cancel) = {
            let mut ctx = self.context.write().await;
            if matches!(ctx.phase, SessionPhase::Joining | SessionPhase::Joined) {
                return Err(SessionError::AlreadyJoined);
            }

            let room_id = ctx.reconcile_rooms(self.rooms);
            let room = self
                .rooms
                .get(&room_id)
                .ok_or_else(|| SessionError::UnknownRoom(room_id.clone()))?
                .clone();

            // Decided from static capabilities only: nothing is allocated
            // and no network call is made before this point.
            let kind = ctx.transport;
            let capabilities = self
                .transports
                .capabilities(kind)
                .ok_or(TransportError::Unavailable(kind))?;
            if room.metadata && !capabilities.position_metadata {
                let err = SessionError::JoinBlocked {
                    room: room.id.clone(),
                    transport: kind,
                };
                log::warn!("{err}");
                ctx.phase = SessionPhase::Blocked;
                ctx.blocked_reason = Some(err.to_string());
                self.publish_rooms(&ctx);
                return Err(err);
            }

            ctx.position.clamp(room.bounds);
            let transport = self.transports.create(kind, Arc::clone(&self.tokens))?;
            let participant_id = transport.generate_unique_id();

            let threshold = if self.engine.is_muted() {
                0.0
            } else {
                ctx.threshold
            };
            let params = JoinParams {
                participant_id,
                channel: format!("{}:{}", ctx.channel_prefix, room.id),
                position: ctx.position.audio(room.bounds),
                noise_gate_threshold: threshold,
                video: room.video,
                metadata: room.metadata,
            };

            let cancel = CancellationToken::new();
            *lock_cancel(&self.join_cancel) = Some(cancel.clone());
            ctx.phase = SessionPhase::Joining;
            ctx.blocked_reason = None;
            self.publish_rooms(&ctx);
            (room, params, transport, cancel)
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.engine.join(transport, params.clone()) => Some(result),
        };
        lock_cancel(&self.join_cancel).take();

        match outcome {
            None => {
                log::info!("join of {} was cancelled", params.channel);
                if let Err(err) = self.engine.leave(false).await {
                    log::debug!("cleanup after cancelled join: {err}");
                }
                // The join was abandoned by a leave, which ends back in the
                // server's room.
                self.fall_back_to_idle(true).await;
                return Err(SessionError::Cancelled);
            }
            Some(Err(err)) => {
                log::warn!("failed to join {}: {err}", params.channel);
                self.fall_back_to_idle(false).await;
                return Err(err.into());
            }
            Some(Ok(())) => {}
        }

        let local_sources = {
            let mut ctx = self.context.write().await;
            let id = params.participant_id.clone();
            ctx.phase = SessionPhase::Joined;
            ctx.listener_id = Some(id.clone());
            let username = ctx.username.clone();
            ctx.usernames.insert(id.clone(), username);
            ctx.elements.clear();
            ctx.players.clear();

            if room.video {
                self.engine.play_video(&id, LOCAL_PLAYER);
            } else {
                let listener = ctx.listener_element(self.rooms);
                ctx.elements.extend(listener);
            }
            log::info!("joined {} as {id}", params.channel);
            ctx.local_sources_enabled
        };

        if local_sources {
            self.start_local_sources(&room).await;
        }
        if let Err(err) = self.send_username().await {
            log::warn!("failed to broadcast username: {err}");
        }
        if room.video {
            self.update_video_positions().await;
        }

        let ctx = self.context.read().await;
        self.publish_all(&ctx);
        Ok(())
    }

    pub async fn leave(&self, will_restart: bool) -> Result<(), SessionError> {
        {
            let mut ctx = self.context.write().await;
            match ctx.phase {
                SessionPhase::Joined => {}
                SessionPhase::Blocked => {
                    ctx.phase = SessionPhase::Idle;
                    ctx.blocked_reason = None;
                    self.publish_rooms(&ctx);
                    return Ok(());
                }
                _ => return Ok(()),
            }
            ctx.phase = SessionPhase::Leaving;
            self.publish_rooms(&ctx);
        }

        self.ambient.stop_all();
        let result = self.engine.leave(will_restart).await;

        let mut ctx = self.context.write().await;
        ctx.phase = SessionPhase::Idle;
        ctx.listener_id = None;
        ctx.usernames.clear();
        ctx.elements.clear();
        ctx.players.clear();
        ctx.current_room = ctx.server_room.clone();
        log::info!("left room (restart: {will_restart})");
        self.publish_all(&ctx);
        drop(ctx);

        result.map_err(Into::into)
    }

    /// Leaves the current room if joined, then joins `room_id`.
    pub async fn switch_room(&self, room_id: &str) -> Result<(), SessionError> {
        if !self.rooms.contains(room_id) {
            return Err(SessionError::UnknownRoom(room_id.to_string()));
        }

        if self.context.read().await.is_joined() {
            self.leave(true).await?;
        }
        self.context.write().await.current_room = Some(room_id.to_string());
        self.join().await
    }

    /// Marks any in-flight join as discarded. Returns whether one was
    /// pending.
    pub fn cancel_pending_join(&self) -> bool {
        match lock_cancel(&self.join_cancel).take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn set_username(&self, username: String) -> Result<(), SessionError> {
        let joined = {
            let mut ctx = self.context.write().await;
            ctx.username = username.clone();
            if let Some(id) = ctx.listener_id.clone() {
                ctx.usernames.insert(id.clone(), username.clone());
                if let Some(element) = ctx.element_mut(&id) {
                    element.name = Some(username);
                }
            }
            self.publish_controls(&ctx);
            ctx.is_joined()
        };
        if joined {
            self.send_username().await?;
            let ctx = self.context.read().await;
            self.publish_scene(&ctx);
            self.publish_players(&ctx);
        }
        Ok(())
    }

    /// Broadcasts the local display name. A blank name is not sent.
    pub async fn send_username(&self) -> Result<(), SessionError> {
        let username = {
            let ctx = self.context.read().await;
            let Some(id) = ctx.listener_id.as_ref() else {
                return Ok(());
            };
            match ctx.usernames.get(id) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => return Ok(()),
            }
        };

        let payload = serde_json::to_vec(&Broadcast::Username { username })
            .map_err(|err| TransportError::Broadcast(err.to_string()))?;
        self.engine.send_broadcast(Bytes::from(payload))?;
        Ok(())
    }

    pub async fn toggle_local_sources(&self) -> bool {
        let (enabled, room) = {
            let mut ctx = self.context.write().await;
            ctx.local_sources_enabled = !ctx.local_sources_enabled;
            let room = ctx
                .is_joined()
                .then(|| ctx.active_room(self.rooms).clone());
            (ctx.local_sources_enabled, room)
        };

        if let Some(room) = room {
            if enabled {
                self.start_local_sources(&room).await;
            } else {
                self.stop_local_sources().await;
            }
        }

        let ctx = self.context.read().await;
        self.publish_controls(&ctx);
        self.publish_scene(&ctx);
        enabled
    }

    pub async fn toggle_mute(&self) -> bool {
        let muted = !self.engine.is_muted();
        self.engine.set_muted(muted);

        let ctx = self.context.read().await;
        // A 0 dB gate keeps the microphone closed while muted.
        self.engine
            .set_threshold(if muted { 0.0 } else { ctx.threshold });
        self.publish_controls(&ctx);
        muted
    }

    pub async fn toggle_aec(&self) -> bool {
        let enabled = !self.engine.is_aec_enabled();
        self.engine.set_aec_enabled(enabled);

        let ctx = self.context.read().await;
        if ctx.is_joined() && ctx.active_room(self.rooms).video {
            if let Some(id) = ctx.listener_id.as_deref() {
                self.engine.play_video(id, LOCAL_PLAYER);
            }
        }
        self.publish_controls(&ctx);
        enabled
    }

    pub async fn toggle_noise_suppression(&self) -> bool {
        let enabled = !self.engine.is_noise_suppression_enabled();
        self.engine.set_noise_suppression_enabled(enabled);
        let ctx = self.context.read().await;
        self.publish_controls(&ctx);
        enabled
    }

    pub async fn set_threshold(&self, threshold: f32) {
        let mut ctx = self.context.write().await;
        ctx.threshold = threshold;
        if !self.engine.is_muted() {
            self.engine.set_threshold(threshold);
        }
        self.publish_controls(&ctx);
    }

    /// Applies elements dragged on the canvas. The listener is clamped into
    /// the room before its position reaches the engine; draggable local
    /// sources are moved as is.
    pub async fn apply_canvas_drag(&self, moves: &[CanvasMove]) {
        let mut ctx = self.context.write().await;
        let room = ctx.active_room(self.rooms);
        if room.video {
            return;
        }
        let bounds = room.bounds;
        let listener = ctx.listener_id.clone();

        for moved in moves {
            let (x, y) = canvas_to_audio(
                CanvasPoint {
                    x: moved.x,
                    y: moved.y,
                },
                bounds,
            );

            if listener.as_deref() == Some(moved.id.as_str()) {
                ctx.position.set_x(x, bounds);
                ctx.position.set_y(y, bounds);
                ctx.position.o = moved.o;
                ctx.position.clamp(bounds);
                ctx.position_set = true;
                self.engine
                    .set_listener_position(ctx.position.audio(bounds));

                let canvas = ctx.position.canvas(bounds);
                let o = ctx.position.o;
                if let Some(element) = ctx.element_mut(&moved.id) {
                    element.x = canvas.x;
                    element.y = canvas.y;
                    element.o = o;
                }
                continue;
            }

            let Some(element) = ctx.element_mut(&moved.id) else {
                continue;
            };
            if !element.clickable {
                continue;
            }
            element.x = moved.x;
            element.y = moved.y;
            element.o = moved.o;
            self.engine.set_source_position(&moved.id, x, y);
        }

        self.publish_scene(&ctx);
    }

    /// Spreads video participants across the frontal half-plane following
    /// the on-screen tile order.
    pub async fn update_video_positions(&self) {
        {
            let ctx = self.context.read().await;
            if !ctx.is_joined() || !ctx.active_room(self.rooms).video {
                return;
            }
        }

        for (id, azimuth) in linear_azimuths(&self.view.video_tiles()) {
            self.engine
                .set_polar_source_position(&id, azimuth, VIDEO_SOURCE_DISTANCE);
            log::debug!("set {id} to azimuth {:.1} deg", azimuth.to_degrees());
        }
    }

    /// Unsolicited signaling traffic. Tracks the server's idea of the
    /// current room and, before joining, takes the first seat the server
    /// assigns.
    pub async fn handle_notification(&self, envelope: ServerEnvelope) {
        let mut ctx = self.context.write().await;
        let server_room = envelope.room.clone().or_else(|| ctx.current_room.clone());
        ctx.server_room = server_room;

        // Room adoption and seating wait until no join or leave is in flight.
        let settled = matches!(ctx.phase, SessionPhase::Idle | SessionPhase::Blocked);
        if let ServerMessage::JoinRoom { nth } = envelope.body {
            if settled {
                ctx.current_room = ctx.server_room.clone();
                if !ctx.position_set {
                    let room = ctx.active_room(self.rooms);
                    let bounds = room.bounds;
                    if let Some(seat) = nth.and_then(|nth| room.seat(nth)) {
                        ctx.position.set_from_audio(seat, bounds);
                        ctx.position.clamp(bounds);
                        ctx.position_set = true;
                        log::info!(
                            "took seat {} in {}: ({}, {}, {:.0} deg)",
                            nth.unwrap_or_default(),
                            room.id,
                            seat.x,
                            seat.y,
                            seat.o.to_degrees()
                        );
                    }
                }
            }
        }

        self.publish_rooms(&ctx);
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::RemotePositionUpdated { id, x, y, o } => {
                let mut ctx = self.context.write().await;
                let bounds = ctx.active_room(self.rooms).bounds;
                let canvas = audio_to_canvas(x, y, bounds);
                if let Some(element) = ctx.element_mut(&id) {
                    element.x = canvas.x;
                    element.y = canvas.y;
                    element.o = o;
                    self.publish_scene(&ctx);
                }
            }
            EngineEvent::RemoteVolumeUpdated { id, level } => {
                let mut ctx = self.context.write().await;
                if let Some(element) = ctx.element_mut(&id) {
                    element.radius = level_to_radius(level);
                    self.publish_scene(&ctx);
                }
            }
            EngineEvent::BroadcastReceived { id, payload } => {
                self.receive_broadcast(&id, &payload).await;
            }
            EngineEvent::RemoteSourceConnected { id } => {
                self.remote_connected(id).await;
            }
            EngineEvent::RemoteSourceDisconnected { id } => {
                self.remote_disconnected(&id).await;
            }
            EngineEvent::Error { message } => {
                log::warn!("audio engine error: {message}");
            }
        }
    }

    async fn receive_broadcast(&self, id: &str, payload: &[u8]) {
        let message = match serde_json::from_slice::<Broadcast>(payload) {
            Ok(message) => message,
            Err(err) => {
                log::warn!(
                    "ignoring malformed broadcast from {id}: {err} ({})",
                    String::from_utf8_lossy(payload)
                );
                return;
            }
        };

        match message {
            Broadcast::Username { username } => {
                let mut ctx = self.context.write().await;
                ctx.usernames.insert(id.to_string(), username.clone());
                if let Some(element) = ctx.element_mut(id) {
                    element.name = Some(username);
                }
                self.publish_scene(&ctx);
                self.publish_players(&ctx);
            }
            Broadcast::Unknown => {
                log::warn!(
                    "unknown broadcast message type from {id}: {}",
                    String::from_utf8_lossy(payload)
                );
            }
        }
    }

    async fn remote_connected(&self, id: String) {
        let video = {
            let mut ctx = self.context.write().await;
            let video = ctx.active_room(self.rooms).video;
            if video {
                if !ctx.players.contains(&id) {
                    ctx.players.push(id.clone());
                }
                self.engine.play_video(&id, &remote_player_target(&id));
                self.publish_players(&ctx);
            } else if ctx.element_mut(&id).is_none() {
                let name = ctx.usernames.get(&id).cloned();
                ctx.elements.push(SceneElement {
                    id: id.clone(),
                    icon: ElementIcon::SourceIcon,
                    x: 0.5,
                    y: 0.5,
                    o: 0.0,
                    radius: MIN_RADIUS,
                    alpha: REMOTE_ALPHA,
                    clickable: false,
                    name,
                });
                self.publish_scene(&ctx);
            }
            video
        };

        if video {
            self.update_video_positions().await;
        }
        // Newcomers learn our name from this.
        if let Err(err) = self.send_username().await {
            log::warn!("failed to broadcast username: {err}");
        }
    }

    async fn remote_disconnected(&self, id: &str) {
        let video = {
            let mut ctx = self.context.write().await;
            ctx.players.retain(|player| player != id);
            ctx.remove_element(id);
            self.publish_scene(&ctx);
            self.publish_players(&ctx);
            ctx.active_room(self.rooms).video
        };
        if self.ambient.unregister(id) {
            log::info!("local source {id} went away; its group will not restart");
        }
        if video {
            self.update_video_positions().await;
        }
    }

    async fn start_local_sources(&self, room: &RoomSpec) {
        for group in &room.ambient_groups {
            match self.ambient.start_group(group, room.bounds).await {
                Ok(started) => self.add_source_elements(room, started).await,
                Err(err) => log::warn!("ambient group in {} did not start: {err}", room.id),
            }
        }
    }

    async fn add_source_elements(&self, room: &RoomSpec, started: Vec<StartedSource>) {
        let mut ctx = self.context.write().await;
        for source in started {
            let canvas = audio_to_canvas(source.position.x, source.position.y, room.bounds);
            ctx.usernames
                .insert(source.id.clone(), source.display_name.clone());
            ctx.elements.push(SceneElement {
                id: source.id,
                icon: ElementIcon::SoundIcon,
                x: canvas.x,
                y: canvas.y,
                o: 0.0,
                radius: MIN_RADIUS,
                alpha: REMOTE_ALPHA,
                clickable: true,
                name: Some(source.display_name),
            });
        }
    }

    async fn stop_local_sources(&self) {
        let stopped = self.ambient.stop_all();
        let mut ctx = self.context.write().await;
        for id in &stopped {
            ctx.remove_element(id);
            ctx.usernames.remove(id);
        }
    }

    async fn fall_back_to_idle(&self, restore_server_room: bool) {
        let mut ctx = self.context.write().await;
        ctx.phase = SessionPhase::Idle;
        ctx.listener_id = None;
        if restore_server_room {
            ctx.current_room = ctx.server_room.clone();
        }
        self.publish_rooms(&ctx);
    }

    pub fn controls_event(&self, ctx: &SessionContext) -> ControlsEvent {
        ControlsEvent {
            username: ctx.username.clone(),
            muted: self.engine.is_muted(),
            aec_enabled: self.engine.is_aec_enabled(),
            noise_suppression_enabled: self.engine.is_noise_suppression_enabled(),
            local_sources_enabled: ctx.local_sources_enabled,
            threshold: ctx.threshold,
        }
    }

    pub async fn publish_snapshot(&self) {
        let ctx = self.context.read().await;
        self.publish_all(&ctx);
    }

    fn publish_all(&self, ctx: &SessionContext) {
        self.publish_rooms(ctx);
        self.publish_scene(ctx);
        self.publish_controls(ctx);
        self.publish_players(ctx);
    }

    fn publish_rooms(&self, ctx: &SessionContext) {
        if let Err(err) = emit_rooms(self.view.as_ref(), &ctx.rooms_event(self.rooms)) {
            log::warn!("failed to emit rooms: {err}");
        }
    }

    fn publish_scene(&self, ctx: &SessionContext) {
        if let Err(err) = emit_scene(self.view.as_ref(), &ctx.scene_event(self.rooms)) {
            log::warn!("failed to emit scene: {err}");
        }
    }

    fn publish_controls(&self, ctx: &SessionContext) {
        if let Err(err) = emit_controls(self.view.as_ref(), &self.controls_event(ctx)) {
            log::warn!("failed to emit controls: {err}");
        }
    }

    fn publish_players(&self, ctx: &SessionContext) {
        if let Err(err) = emit_players(self.view.as_ref(), &ctx.players_event(self.rooms)) {
            log::warn!("failed to emit players: {err}");
        }
    }
}

#[cfg(test)]
mod tests;
