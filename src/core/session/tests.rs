use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::*;
use crate::core::ambient::clips::tests::wav_bytes;
use crate::core::media::{
    HeadlessEngine, LoopbackTransport, ParticipantId, Transport, TransportCapabilities,
    TransportRegistry,
};
use crate::core::signaling::SignalingError;
use crate::core::spatial::LayoutTile;

#[derive(Default)]
struct RecordingView {
    events: StdMutex<Vec<(String, Value)>>,
    tiles: StdMutex<Vec<LayoutTile>>,
}

impl RecordingView {
    fn last(&self, event: &str) -> Option<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
    }
}

impl RoomView for RecordingView {
    fn emit(&self, event: &str, payload: Value) -> Result<(), String> {
        self.events.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }

    fn video_tiles(&self) -> Vec<LayoutTile> {
        self.tiles.lock().unwrap().clone()
    }
}

struct FixedTokens;

#[async_trait]
impl TokenSource for FixedTokens {
    async fn fetch_token(&self, uid: &str, channel: &str, _: u32) -> Result<String, SignalingError> {
        Ok(format!("token:{uid}:{channel}"))
    }
}

/// Hosted-style transport that needs a token before the engine can join.
struct TokenTransport {
    tokens: Arc<dyn TokenSource>,
}

#[async_trait]
impl Transport for TokenTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Agora
    }

    fn generate_unique_id(&self) -> ParticipantId {
        "agora-1".to_string()
    }

    async fn credentials(
        &self,
        participant_id: &str,
        channel: &str,
    ) -> Result<Option<String>, TransportError> {
        Ok(Some(self.tokens.fetch_token(participant_id, channel, 1).await?))
    }
}

struct Harness {
    engine: Arc<HeadlessEngine>,
    view: Arc<RecordingView>,
    session: Arc<Session>,
}

fn settings(kind: TransportKind) -> SessionSettings {
    SessionSettings {
        username: "ana".to_string(),
        transport: kind,
        noise_gate_threshold: -40.0,
        local_sources_enabled: false,
    }
}

fn harness_with(
    transports: TransportRegistry,
    settings: SessionSettings,
    clips: ClipLoader,
) -> Harness {
    let engine = Arc::new(HeadlessEngine::new());
    let view = Arc::new(RecordingView::default());
    let session = Session::new(
        SessionDeps {
            engine: engine.clone(),
            transports: Arc::new(transports),
            tokens: Arc::new(FixedTokens),
            view: view.clone(),
            clips,
        },
        settings,
    );
    Harness {
        engine,
        view,
        session: Arc::new(session),
    }
}

fn harness() -> Harness {
    harness_with(
        TransportRegistry::new(),
        settings(TransportKind::Loopback),
        ClipLoader::new("."),
    )
}

fn join_room(room: &str, nth: Option<usize>) -> ServerEnvelope {
    ServerEnvelope {
        room: Some(room.to_string()),
        body: ServerMessage::JoinRoom { nth },
    }
}

fn conf_bounds() -> crate::core::spatial::RoomBounds {
    RoomRegistry::builtin()
        .get("room-conf-table")
        .expect("room")
        .bounds
}

#[tokio::test]
async fn join_uses_prefixed_channel_and_leave_restores_server_room() {
    let h = harness();
    h.session.set_channel_prefix("pfx".to_string()).await;

    h.session.join().await.expect("join");
    let ctx = h.session.context().await;
    assert_eq!(ctx.phase, SessionPhase::Joined);
    assert_eq!(ctx.current_room.as_deref(), Some("room-conf-table"));
    let params = h.engine.joined().expect("engine joined");
    assert_eq!(params.channel, "pfx:room-conf-table");
    assert!(params.metadata);
    assert_eq!(params.noise_gate_threshold, -40.0);
    assert_eq!(ctx.listener_id.as_deref(), Some(params.participant_id.as_str()));
    assert_eq!(ctx.elements.len(), 1);
    assert_eq!(ctx.elements[0].icon, ElementIcon::Listener);

    assert!(matches!(
        h.session.join().await,
        Err(SessionError::AlreadyJoined)
    ));

    h.session.leave(false).await.expect("leave");
    let ctx = h.session.context().await;
    assert_eq!(ctx.phase, SessionPhase::Idle);
    assert_eq!(ctx.current_room, ctx.server_room);
    assert!(ctx.elements.is_empty());
    assert!(ctx.listener_id.is_none());
    assert_eq!(h.engine.leave_count(), 1);
    assert_eq!(
        h.view.last("core/rooms").expect("rooms event")["phase"],
        json!("idle")
    );
}

#[tokio::test]
async fn seat_assignment_initializes_position_once() {
    let h = harness();
    h.session
        .handle_notification(join_room("room-conf-table", Some(2)))
        .await;

    let ctx = h.session.context().await;
    assert!(ctx.position_set);
    assert_eq!(ctx.current_room.as_deref(), Some("room-conf-table"));
    let audio = ctx.position.audio(conf_bounds());
    assert!(audio.x.abs() < 1e-5);
    assert!((audio.y - 1.0).abs() < 1e-5);
    assert!((audio.o - PI).abs() < 1e-5);

    h.session
        .handle_notification(join_room("room-conf-table", Some(0)))
        .await;
    let again = h.session.context().await.position.audio(conf_bounds());
    assert!((again.y - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn seat_outside_the_list_is_ignored_and_later_seat_still_applies() {
    let h = harness();
    h.session
        .handle_notification(join_room("room-conf-table", Some(42)))
        .await;
    assert!(!h.session.context().await.position_set);

    h.session
        .handle_notification(join_room("room-conf-table", Some(0)))
        .await;
    let audio = h.session.context().await.position.audio(conf_bounds());
    assert!((audio.y + 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn seat_assignment_is_ignored_while_joined() {
    let h = harness();
    h.session.join().await.expect("join");
    let before = h.session.context().await.position;

    h.session
        .handle_notification(join_room("room-bar", Some(1)))
        .await;
    let ctx = h.session.context().await;
    assert_eq!(ctx.position, before);
    assert_eq!(ctx.server_room.as_deref(), Some("room-bar"));
    assert_eq!(ctx.current_room.as_deref(), Some("room-conf-table"));
}

#[tokio::test]
async fn messages_without_room_fall_back_to_the_current_room() {
    let h = harness();
    h.session.join().await.expect("join");
    h.session
        .handle_notification(ServerEnvelope {
            room: None,
            body: ServerMessage::Unknown,
        })
        .await;
    assert_eq!(
        h.session.context().await.server_room.as_deref(),
        Some("room-conf-table")
    );
}

#[tokio::test]
async fn blocked_join_allocates_nothing() {
    let created = Arc::new(AtomicUsize::new(0));
    let mut transports = TransportRegistry::new();
    let counter = Arc::clone(&created);
    transports.register(
        TransportKind::P2p,
        TransportCapabilities {
            position_metadata: false,
        },
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(LoopbackTransport::new()) as Arc<dyn Transport>
        },
    );
    let h = harness_with(transports, settings(TransportKind::P2p), ClipLoader::new("."));

    let err = h.session.join().await.expect_err("blocked");
    assert!(matches!(
        err,
        SessionError::JoinBlocked {
            transport: TransportKind::P2p,
            ..
        }
    ));
    assert!(!err.is_retriable());
    assert_eq!(created.load(Ordering::SeqCst), 0);
    assert!(h.engine.joined().is_none());
    let ctx = h.session.context().await;
    assert_eq!(ctx.phase, SessionPhase::Blocked);
    assert!(ctx.listener_id.is_none());
    assert!(h.view.last("core/rooms").expect("rooms")["reason"].is_string());

    // The video room carries no position metadata, so the same transport works.
    h.session.switch_room("room-video").await.expect("video join");
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.phase().await, SessionPhase::Joined);
}

#[tokio::test]
async fn missing_transport_is_not_retriable() {
    let h = harness_with(
        TransportRegistry::new(),
        settings(TransportKind::Agora),
        ClipLoader::new("."),
    );
    let err = h.session.join().await.expect_err("no agora");
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Unavailable(TransportKind::Agora))
    ));
    assert!(!err.is_retriable());
    assert_eq!(h.session.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn hosted_transport_fetches_a_token_while_joining() {
    let mut transports = TransportRegistry::new();
    transports.register(
        TransportKind::Agora,
        TransportCapabilities {
            position_metadata: true,
        },
        |tokens| Arc::new(TokenTransport { tokens }) as Arc<dyn Transport>,
    );
    let h = harness_with(transports, settings(TransportKind::Agora), ClipLoader::new("."));
    h.session.set_channel_prefix("pfx".to_string()).await;

    h.session.join().await.expect("join");
    assert_eq!(
        h.engine.credentials().as_deref(),
        Some("token:agora-1:pfx:room-conf-table")
    );
}

#[tokio::test]
async fn switching_rooms_leaves_then_joins() {
    let h = harness();
    h.session.join().await.expect("join");
    h.session.switch_room("room-bar").await.expect("switch");

    assert_eq!(h.engine.leave_count(), 1);
    let params = h.engine.joined().expect("joined");
    assert!(params.channel.ends_with(":room-bar"));
    let ctx = h.session.context().await;
    assert_eq!(ctx.current_room.as_deref(), Some("room-bar"));
    assert!(ctx
        .position
        .audio(RoomRegistry::builtin().get("room-bar").expect("bar").bounds)
        .x
        .abs()
        <= 8.0);

    assert!(matches!(
        h.session.switch_room("room-nowhere").await,
        Err(SessionError::UnknownRoom(_))
    ));
    assert_eq!(h.session.phase().await, SessionPhase::Joined);
}

#[tokio::test]
async fn username_is_broadcast_on_join_and_on_change() {
    let h = harness();
    h.session.join().await.expect("join");
    let sent = h.engine.broadcasts();
    assert_eq!(sent.len(), 1);
    let first: Value = serde_json::from_slice(&sent[0]).expect("json");
    assert_eq!(first, json!({ "type": "username", "username": "ana" }));

    h.session
        .set_username("bea".to_string())
        .await
        .expect("rename");
    let sent = h.engine.broadcasts();
    assert_eq!(sent.len(), 2);
    let second: Value = serde_json::from_slice(&sent[1]).expect("json");
    assert_eq!(second["username"], "bea");
}

#[tokio::test]
async fn blank_username_is_not_broadcast() {
    let mut blank = settings(TransportKind::Loopback);
    blank.username = String::new();
    let h = harness_with(TransportRegistry::new(), blank, ClipLoader::new("."));
    h.session.join().await.expect("join");
    assert!(h.engine.broadcasts().is_empty());
}

#[tokio::test]
async fn broadcasts_update_names_and_unknown_ones_are_ignored() {
    let h = harness();
    h.session.join().await.expect("join");
    h.session
        .handle_engine_event(EngineEvent::RemoteSourceConnected { id: "bob".into() })
        .await;

    h.session
        .handle_engine_event(EngineEvent::BroadcastReceived {
            id: "bob".into(),
            payload: Bytes::from_static(br#"{"type":"username","username":"Bob"}"#),
        })
        .await;
    h.session
        .handle_engine_event(EngineEvent::BroadcastReceived {
            id: "bob".into(),
            payload: Bytes::from_static(br#"{"type":"emoji","value":"wave"}"#),
        })
        .await;
    h.session
        .handle_engine_event(EngineEvent::BroadcastReceived {
            id: "bob".into(),
            payload: Bytes::from_static(b"\xff not json"),
        })
        .await;

    let ctx = h.session.context().await;
    assert_eq!(ctx.usernames.get("bob").map(String::as_str), Some("Bob"));
    let bob = ctx
        .elements
        .iter()
        .find(|element| element.id == "bob")
        .expect("bob on canvas");
    assert_eq!(bob.name.as_deref(), Some("Bob"));
}

#[tokio::test]
async fn remote_sources_follow_position_and_volume() {
    let h = harness();
    h.session.join().await.expect("join");
    h.session
        .handle_engine_event(EngineEvent::RemoteSourceConnected { id: "bob".into() })
        .await;
    // Every connect re-announces our name.
    assert_eq!(h.engine.broadcasts().len(), 2);

    h.session
        .handle_engine_event(EngineEvent::RemotePositionUpdated {
            id: "bob".into(),
            x: 1.0,
            y: 1.0,
            o: 0.5,
        })
        .await;
    h.session
        .handle_engine_event(EngineEvent::RemoteVolumeUpdated {
            id: "bob".into(),
            level: 100.0,
        })
        .await;

    let ctx = h.session.context().await;
    let bob = ctx
        .elements
        .iter()
        .find(|element| element.id == "bob")
        .expect("bob");
    assert_eq!(bob.icon, ElementIcon::SourceIcon);
    assert!(!bob.clickable);
    assert!((bob.x - 0.75).abs() < 1e-5);
    assert!((bob.y - 0.25).abs() < 1e-5);
    assert_eq!(bob.o, 0.5);
    assert!((bob.radius - 0.06).abs() < 1e-3);

    h.session
        .handle_engine_event(EngineEvent::RemoteSourceDisconnected { id: "bob".into() })
        .await;
    assert!(h
        .session
        .context()
        .await
        .elements
        .iter()
        .all(|element| element.id != "bob"));
}

#[tokio::test]
async fn video_room_places_participants_by_tile_order() {
    let h = harness();
    h.session.switch_room("room-video").await.expect("join video");
    let me = h.session.context().await.listener_id.expect("listener");
    assert!(h
        .engine
        .videos()
        .contains(&(me.clone(), LOCAL_PLAYER.to_string())));

    *h.view.tiles.lock().unwrap() = vec![
        LayoutTile {
            id: me.clone(),
            left: 0.0,
            right: 100.0,
        },
        LayoutTile {
            id: "bob".into(),
            left: 100.0,
            right: 200.0,
        },
    ];
    h.session
        .handle_engine_event(EngineEvent::RemoteSourceConnected { id: "bob".into() })
        .await;

    assert!(h
        .engine
        .videos()
        .contains(&("bob".to_string(), "player-bob".to_string())));
    let (azimuth, distance) = h.engine.polar_position("bob").expect("bob placed");
    assert!((azimuth - PI / 4.0).abs() < 1e-5);
    assert_eq!(distance, 1.0);
    let (mine, _) = h.engine.polar_position(&me).expect("me placed");
    assert!((mine + PI / 4.0).abs() < 1e-5);

    let players = h.view.last("core/players").expect("players");
    assert_eq!(players["tiles"][1]["target"], "player-bob");
    assert!(h.session.context().await.elements.is_empty());
}

#[tokio::test]
async fn dragging_the_listener_clamps_before_the_engine_sees_it() {
    let h = harness();
    h.session.join().await.expect("join");
    let me = h.session.context().await.listener_id.expect("listener");

    h.session
        .apply_canvas_drag(&[CanvasMove {
            id: me.clone(),
            x: 2.0,
            y: -1.0,
            o: 1.0,
        }])
        .await;

    let listener = h.engine.listener_position().expect("listener set");
    assert_eq!((listener.x, listener.y, listener.o), (2.0, 2.0, 1.0));
    let ctx = h.session.context().await;
    assert!(ctx.position_set);
    let element = ctx.elements.iter().find(|e| e.id == me).expect("element");
    assert!((element.x - 1.0).abs() < 1e-5);
    assert!(element.y.abs() < 1e-5);
}

#[tokio::test]
async fn drag_blocks_later_seat_assignment() {
    let h = harness();
    h.session.join().await.expect("join");
    let me = h.session.context().await.listener_id.expect("listener");
    h.session
        .apply_canvas_drag(&[CanvasMove {
            id: me,
            x: 0.5,
            y: 0.5,
            o: 0.0,
        }])
        .await;
    h.session.leave(true).await.expect("leave");

    h.session
        .handle_notification(join_room("room-conf-table", Some(2)))
        .await;
    let audio = h.session.context().await.position.audio(conf_bounds());
    assert!(audio.x.abs() < 1e-5 && audio.y.abs() < 1e-5);
}

#[tokio::test(start_paused = true)]
async fn cancelled_join_returns_to_idle() {
    let h = harness();
    h.engine.set_join_delay(Duration::from_secs(30));

    let session = Arc::clone(&h.session);
    let join = tokio::spawn(async move { session.join().await });
    while h.session.phase().await != SessionPhase::Joining {
        tokio::task::yield_now().await;
    }

    assert!(h.session.cancel_pending_join());
    let err = join.await.expect("task").expect_err("cancelled");
    assert!(matches!(err, SessionError::Cancelled));
    assert!(err.is_retriable());
    assert_eq!(h.session.phase().await, SessionPhase::Idle);
    assert!(h.engine.joined().is_none());
    assert!(!h.session.cancel_pending_join());
}

#[tokio::test(start_paused = true)]
async fn room_notification_during_join_only_moves_the_server_room() {
    let h = harness();
    h.engine.set_join_delay(Duration::from_secs(30));

    let session = Arc::clone(&h.session);
    let switch = tokio::spawn(async move { session.switch_room("room-bar").await });
    while h.session.phase().await != SessionPhase::Joining {
        tokio::task::yield_now().await;
    }

    h.session
        .handle_notification(join_room("room-conf-table", Some(2)))
        .await;
    switch.await.expect("task").expect("switch");

    let ctx = h.session.context().await;
    assert_eq!(ctx.phase, SessionPhase::Joined);
    assert_eq!(ctx.current_room.as_deref(), Some("room-bar"));
    assert_eq!(ctx.server_room.as_deref(), Some("room-conf-table"));
    assert!(!ctx.position_set);

    let bar = RoomRegistry::builtin().get("room-bar").expect("room").bounds;
    assert_eq!(h.engine.listener_position(), Some(ctx.position.audio(bar)));
    assert!(h.engine.joined().expect("joined").channel.ends_with(":room-bar"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_switch_falls_back_to_the_server_room() {
    let h = harness();
    h.session
        .handle_notification(join_room("room-conf-table", None))
        .await;
    h.engine.set_join_delay(Duration::from_secs(30));

    let session = Arc::clone(&h.session);
    let switch = tokio::spawn(async move { session.switch_room("room-bar").await });
    while h.session.phase().await != SessionPhase::Joining {
        tokio::task::yield_now().await;
    }
    assert!(h.session.cancel_pending_join());
    let err = switch.await.expect("task").expect_err("cancelled");
    assert!(matches!(err, SessionError::Cancelled));
    assert_eq!(
        h.session.context().await.current_room.as_deref(),
        Some("room-conf-table")
    );

    h.engine.set_join_delay(Duration::ZERO);
    h.session.join().await.expect("plain join");
    let joined = h.engine.joined().expect("joined");
    assert!(joined.channel.ends_with(":room-conf-table"), "{}", joined.channel);
}

#[tokio::test]
async fn failed_join_keeps_the_chosen_room() {
    let h = harness();
    h.engine.fail_joins(true);
    h.session
        .switch_room("room-quad-music")
        .await
        .expect_err("refused");
    assert_eq!(
        h.session.context().await.current_room.as_deref(),
        Some("room-quad-music")
    );
}

#[tokio::test]
async fn failed_join_returns_to_idle() {
    let h = harness();
    h.engine.fail_joins(true);
    let err = h.session.join().await.expect_err("refused");
    assert!(matches!(err, SessionError::Transport(TransportError::Join(_))));
    assert!(err.is_retriable());
    assert_eq!(h.session.phase().await, SessionPhase::Idle);

    h.engine.fail_joins(false);
    h.session.join().await.expect("second attempt");
}

#[tokio::test]
async fn mute_closes_the_gate_and_unmute_restores_the_slider() {
    let h = harness();
    h.session.set_threshold(-25.0).await;
    assert_eq!(h.engine.threshold(), -25.0);

    assert!(h.session.toggle_mute().await);
    assert_eq!(h.engine.threshold(), 0.0);
    h.session.set_threshold(-30.0).await;
    assert_eq!(h.engine.threshold(), 0.0);

    assert!(!h.session.toggle_mute().await);
    assert_eq!(h.engine.threshold(), -30.0);

    let controls = h.view.last("core/controls").expect("controls");
    assert_eq!(controls["muted"], json!(false));
}

#[tokio::test]
async fn aec_toggle_replays_local_video() {
    let h = harness();
    h.session.switch_room("room-video").await.expect("join");
    let before = h.engine.videos().len();

    assert!(h.session.toggle_aec().await);
    assert_eq!(h.engine.videos().len(), before + 1);
    assert!(!h.session.toggle_noise_suppression().await);
}

#[tokio::test]
async fn local_sources_follow_the_toggle() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("sounds")).expect("mkdir");
    for name in ["campfire", "owl", "waterfall", "thunder"] {
        std::fs::write(
            dir.path().join(format!("sounds/{name}.wav")),
            wav_bytes(48_000, 48_000, 3_000),
        )
        .expect("write clip");
    }

    let mut enabled = settings(TransportKind::Loopback);
    enabled.local_sources_enabled = true;
    let h = harness_with(TransportRegistry::new(), enabled, ClipLoader::new(dir.path()));
    h.session.join().await.expect("join");

    let ctx = h.session.context().await;
    let sounds = ctx
        .elements
        .iter()
        .filter(|element| element.icon == ElementIcon::SoundIcon)
        .collect::<Vec<_>>();
    assert_eq!(sounds.len(), 4);
    assert!(sounds.iter().all(|element| element.clickable));
    assert_eq!(h.session.ambient().registered().len(), 4);
    assert!(ctx.usernames.values().any(|name| name == "owl"));

    assert!(!h.session.toggle_local_sources().await);
    let ctx = h.session.context().await;
    assert!(ctx
        .elements
        .iter()
        .all(|element| element.icon != ElementIcon::SoundIcon));
    assert!(h.session.ambient().registered().is_empty());
    assert_eq!(h.engine.live_sources(), 0);

    assert!(h.session.toggle_local_sources().await);
    assert_eq!(h.session.ambient().registered().len(), 4);

    h.session.leave(false).await.expect("leave");
    assert!(h.session.ambient().registered().is_empty());
}
