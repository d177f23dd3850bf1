use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::spatial::LayoutTile;

pub const EVENT_ROOMS: &str = "core/rooms";
pub const EVENT_SCENE: &str = "core/scene";
pub const EVENT_CONTROLS: &str = "core/controls";
pub const EVENT_PLAYERS: &str = "core/players";

/// Where UI updates go. A desktop shell forwards them to its webview; the
/// headless binary logs them.
pub trait RoomView: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), String>;

    /// Video tiles in their current on-screen order.
    fn video_tiles(&self) -> Vec<LayoutTile> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Joining,
    Joined,
    Leaving,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomEntry {
    pub id: String,
    pub video: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomsEvent {
    pub rooms: Vec<RoomEntry>,
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ElementIcon {
    Listener,
    SourceIcon,
    SoundIcon,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneElement {
    pub id: String,
    pub icon: ElementIcon,
    pub x: f32,
    pub y: f32,
    pub o: f32,
    pub radius: f32,
    pub alpha: f32,
    pub clickable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneEvent {
    pub room: String,
    pub background: String,
    /// Video rooms hide the canvas and lay out tiles instead.
    pub canvas_visible: bool,
    pub elements: Vec<SceneElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlsEvent {
    pub username: String,
    pub muted: bool,
    pub aec_enabled: bool,
    pub noise_suppression_enabled: bool,
    pub local_sources_enabled: bool,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerTile {
    pub id: String,
    pub target: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlayersEvent {
    pub tiles: Vec<PlayerTile>,
}

fn emit<T: Serialize>(view: &dyn RoomView, event_name: &str, payload: &T) -> Result<(), String> {
    let value = serde_json::to_value(payload).map_err(|err| err.to_string())?;
    view.emit(event_name, value)
}

pub fn emit_rooms(view: &dyn RoomView, payload: &RoomsEvent) -> Result<(), String> {
    emit(view, EVENT_ROOMS, payload)
}

pub fn emit_scene(view: &dyn RoomView, payload: &SceneEvent) -> Result<(), String> {
    emit(view, EVENT_SCENE, payload)
}

pub fn emit_controls(view: &dyn RoomView, payload: &ControlsEvent) -> Result<(), String> {
    emit(view, EVENT_CONTROLS, payload)
}

pub fn emit_players(view: &dyn RoomView, payload: &PlayersEvent) -> Result<(), String> {
    emit(view, EVENT_PLAYERS, payload)
}

/// Logs every event and lays video tiles out as a strip of equal-width
/// cells in the order of the last players event.
#[derive(Default)]
pub struct LogView {
    tile_order: Mutex<Vec<String>>,
}

impl LogView {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomView for LogView {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), String> {
        if event == EVENT_PLAYERS {
            let players: PlayersEvent =
                serde_json::from_value(payload.clone()).map_err(|err| err.to_string())?;
            let mut order = self
                .tile_order
                .lock()
                .map_err(|_| "tile layout lock poisoned".to_string())?;
            *order = players.tiles.into_iter().map(|tile| tile.id).collect();
        }
        log::info!("{event}: {payload}");
        Ok(())
    }

    fn video_tiles(&self) -> Vec<LayoutTile> {
        let order = match self.tile_order.lock() {
            Ok(order) => order,
            Err(poisoned) => poisoned.into_inner(),
        };
        order
            .iter()
            .enumerate()
            .map(|(idx, id)| LayoutTile {
                id: id.clone(),
                left: idx as f32,
                right: idx as f32 + 1.0,
            })
            .collect()
    }
}
