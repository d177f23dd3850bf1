pub mod actions;
pub mod ambient;
pub mod config;
pub mod events;
pub mod media;
pub mod rooms;
pub mod session;
pub mod signaling;
pub mod spatial;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use actions::{ActionQueue, ActionTicket};
use ambient::ClipLoader;
use config::{save_config_to_path, ClientConfig, ConfigError, LoadedConfig};
use events::RoomView;
use media::{AudioEngine, EngineEvent, TransportFactory};
use session::{CanvasMove, Session, SessionDeps, SessionError, SessionSettings};
use signaling::{Multiplexer, ServerEnvelope, SignalingClient, SignalingError, SignalingSocket};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Config plus where it came from. Dev overrides are never written back.
#[derive(Clone)]
struct SharedConfig {
    path: PathBuf,
    is_dev_override: bool,
    config: Arc<RwLock<ClientConfig>>,
}

impl SharedConfig {
    async fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut ClientConfig),
    {
        let snapshot = {
            let mut config = self.config.write().await;
            change(&mut config);
            config.clone()
        };
        if self.is_dev_override {
            return Ok(());
        }
        save_config_to_path(&self.path, &snapshot)
    }
}

/// The room client: owns the signaling connection, the session and the
/// action queue every user command goes through.
pub struct RoomClient {
    config: SharedConfig,
    session: Arc<Session>,
    signaling: SignalingClient,
    actions: Arc<ActionQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomClient {
    /// Starts the signaling loop and the event pumps, then asks the server
    /// for the channel prefix. Fails if that first exchange fails.
    pub async fn start<S: SignalingSocket>(
        loaded: LoadedConfig,
        socket: S,
        engine: Arc<dyn AudioEngine>,
        transports: Arc<dyn TransportFactory>,
        view: Arc<dyn RoomView>,
    ) -> Result<Self, ClientError> {
        let config = loaded.config.clone();
        let (signaling, notifications) = Multiplexer::start(socket, config.request_timeout());
        let engine_events = engine.subscribe();

        let session = Arc::new(Session::new(
            SessionDeps {
                engine,
                transports,
                tokens: Arc::new(signaling.clone()),
                view,
                clips: ClipLoader::new(config.assets_dir.clone()),
            },
            SessionSettings {
                username: config.username.clone(),
                transport: config.transport,
                noise_gate_threshold: config.noise_gate_threshold,
                local_sources_enabled: config.local_sources_enabled,
            },
        ));
        let actions = Arc::new(ActionQueue::new());

        let mut tasks = vec![
            tokio::spawn(pump_notifications(notifications, Arc::clone(&session))),
            tokio::spawn(pump_engine_events(
                engine_events,
                Arc::clone(&session),
                Arc::clone(&actions),
            )),
        ];

        let prefix = match signaling.channel_prefix(config.group_name()).await {
            Ok(prefix) => prefix,
            Err(err) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(err.into());
            }
        };
        log::info!("channel prefix for {} is {prefix}", config.group_name());
        session.set_channel_prefix(prefix).await;

        // The reply is observed, so seat assignment still happens in the
        // notification pump.
        let current_room = signaling.clone();
        tasks.push(tokio::spawn(async move {
            match current_room.current_room().await {
                Ok(Some(room)) => log::info!("server says current room is {room}"),
                Ok(None) => log::info!("server reported no current room"),
                Err(err) => log::warn!("current room request failed: {err}"),
            }
        }));

        session.publish_snapshot().await;

        Ok(Self {
            config: SharedConfig {
                path: loaded.path,
                is_dev_override: loaded.is_dev_override,
                config: Arc::new(RwLock::new(loaded.config)),
            },
            session,
            signaling,
            actions,
            tasks,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub async fn config(&self) -> ClientConfig {
        self.config.config.read().await.clone()
    }

    /// Queued or running commands. The UI keeps its buttons disabled while
    /// this is non-zero.
    pub fn pending_actions(&self) -> usize {
        self.actions.pending()
    }

    pub fn join(&self) -> ActionTicket {
        let session = Arc::clone(&self.session);
        self.actions
            .enqueue("join", async move { session.join().await })
    }

    /// Discards a join that is still in flight, then leaves once the queue
    /// gets to it.
    pub fn leave(&self) -> ActionTicket {
        if self.session.cancel_pending_join() {
            log::info!("leave requested while joining; discarding the join");
        }
        let session = Arc::clone(&self.session);
        self.actions
            .enqueue("leave", async move { session.leave(false).await })
    }

    pub fn switch_room(&self, room_id: impl Into<String>) -> ActionTicket {
        let room_id = room_id.into();
        let session = Arc::clone(&self.session);
        self.actions.enqueue(format!("switch to {room_id}"), async move {
            session.switch_room(&room_id).await
        })
    }

    pub fn set_username(&self, username: &str) -> ActionTicket {
        let username = username.trim().to_string();
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        self.actions.enqueue("set username", async move {
            let stored = username.clone();
            config.update(|config| config.username = stored).await?;
            session.set_username(username).await?;
            Ok::<_, ClientError>(())
        })
    }

    pub fn toggle_local_sources(&self) -> ActionTicket {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        self.actions.enqueue("toggle local sources", async move {
            let enabled = session.toggle_local_sources().await;
            config
                .update(|config| config.local_sources_enabled = enabled)
                .await
        })
    }

    pub fn toggle_mute(&self) -> ActionTicket {
        let session = Arc::clone(&self.session);
        self.actions.enqueue("toggle mute", async move {
            let muted = session.toggle_mute().await;
            log::info!("microphone {}", if muted { "muted" } else { "live" });
            Ok::<_, ClientError>(())
        })
    }

    pub fn toggle_aec(&self) -> ActionTicket {
        let session = Arc::clone(&self.session);
        self.actions.enqueue("toggle aec", async move {
            let enabled = session.toggle_aec().await;
            log::info!("echo cancellation {}", if enabled { "on" } else { "off" });
            Ok::<_, ClientError>(())
        })
    }

    pub fn toggle_noise_suppression(&self) -> ActionTicket {
        let session = Arc::clone(&self.session);
        self.actions.enqueue("toggle noise suppression", async move {
            session.toggle_noise_suppression().await;
            Ok::<_, ClientError>(())
        })
    }

    pub fn set_threshold(&self, threshold: f32) -> ActionTicket {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        self.actions.enqueue("set threshold", async move {
            session.set_threshold(threshold).await;
            config
                .update(|config| config.noise_gate_threshold = threshold)
                .await
        })
    }

    /// Canvas callback; runs immediately rather than through the queue.
    pub async fn canvas_dragged(&self, moves: &[CanvasMove]) {
        self.session.apply_canvas_drag(moves).await;
    }

    pub async fn video_layout_changed(&self) {
        self.session.update_video_positions().await;
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump_notifications(
    mut notifications: mpsc::UnboundedReceiver<ServerEnvelope>,
    session: Arc<Session>,
) {
    while let Some(envelope) = notifications.recv().await {
        session.handle_notification(envelope).await;
    }
    log::debug!("signaling notifications ended");
}

async fn pump_engine_events(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    session: Arc<Session>,
    actions: Arc<ActionQueue>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Error { message } => {
                log::warn!("transport error: {message}; leaving the room");
                session.cancel_pending_join();
                let leaving = Arc::clone(&session);
                actions.enqueue("leave after transport error", async move {
                    leaving.leave(false).await
                });
            }
            other => session.handle_engine_event(other).await,
        }
    }
    log::debug!("audio engine events ended");
}
