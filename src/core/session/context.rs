use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::events::{
    ElementIcon, PlayerTile, PlayersEvent, RoomEntry, RoomsEvent, SceneElement, SceneEvent,
    SessionPhase,
};
use crate::core::media::{ParticipantId, TransportKind};
use crate::core::rooms::{RoomRegistry, RoomSpec};
use crate::core::spatial::{CharacterPosition, MIN_RADIUS};

pub const LOCAL_PLAYER: &str = "local-player";
const UNNAMED: &str = "-";

/// Payloads sent to every participant through the engine's broadcast
/// primitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Broadcast {
    Username { username: String },
    #[serde(other)]
    Unknown,
}

pub fn remote_player_target(id: &str) -> String {
    format!("player-{id}")
}

/// Everything the session knows about the local participant and the room
/// it is in. Built once per client and torn down with it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub phase: SessionPhase,
    pub current_room: Option<String>,
    pub server_room: Option<String>,
    pub listener_id: Option<ParticipantId>,
    pub username: String,
    pub usernames: HashMap<ParticipantId, String>,
    pub position: CharacterPosition,
    /// Set by a seat assignment or a drag; blocks later seat assignments.
    pub position_set: bool,
    pub channel_prefix: String,
    pub transport: TransportKind,
    pub local_sources_enabled: bool,
    pub threshold: f32,
    pub elements: Vec<SceneElement>,
    /// Remote video participants in arrival order.
    pub players: Vec<ParticipantId>,
    pub blocked_reason: Option<String>,
}

impl SessionContext {
    pub fn new(
        username: String,
        transport: TransportKind,
        threshold: f32,
        local_sources_enabled: bool,
    ) -> Self {
        let position = CharacterPosition::from_normalized(
            0.5 * rand::random::<f32>(),
            0.5 * rand::random::<f32>(),
            0.0,
        );
        Self {
            phase: SessionPhase::Idle,
            current_room: None,
            server_room: None,
            listener_id: None,
            username,
            usernames: HashMap::new(),
            position,
            position_set: false,
            channel_prefix: String::new(),
            transport,
            local_sources_enabled,
            threshold,
            elements: Vec::new(),
            players: Vec::new(),
            blocked_reason: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.phase == SessionPhase::Joined
    }

    /// Fills in whichever room id is missing: the server room defaults to
    /// the first registered room, the local room to the server's.
    pub fn reconcile_rooms(&mut self, rooms: &RoomRegistry) -> String {
        let server = self
            .server_room
            .get_or_insert_with(|| rooms.first().id.clone())
            .clone();
        self.current_room.get_or_insert(server).clone()
    }

    pub fn active_room<'r>(&self, rooms: &'r RoomRegistry) -> &'r RoomSpec {
        self.current_room
            .as_deref()
            .or(self.server_room.as_deref())
            .and_then(|id| rooms.get(id))
            .unwrap_or_else(|| rooms.first())
    }

    pub fn element_mut(&mut self, id: &str) -> Option<&mut SceneElement> {
        self.elements.iter_mut().find(|element| element.id == id)
    }

    pub fn remove_element(&mut self, id: &str) -> bool {
        let before = self.elements.len();
        self.elements.retain(|element| element.id != id);
        before != self.elements.len()
    }

    pub fn display_name(&self, id: &str) -> String {
        match self.usernames.get(id) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => UNNAMED.to_string(),
        }
    }

    pub fn listener_element(&self, rooms: &RoomRegistry) -> Option<SceneElement> {
        let id = self.listener_id.clone()?;
        let bounds = self.active_room(rooms).bounds;
        let canvas = self.position.canvas(bounds);
        Some(SceneElement {
            name: Some(self.display_name(&id)),
            id,
            icon: ElementIcon::Listener,
            x: canvas.x,
            y: canvas.y,
            o: self.position.o,
            radius: MIN_RADIUS,
            alpha: 1.0,
            clickable: true,
        })
    }

    pub fn rooms_event(&self, rooms: &RoomRegistry) -> RoomsEvent {
        RoomsEvent {
            rooms: rooms
                .ids()
                .map(|id| RoomEntry {
                    id: id.to_string(),
                    video: rooms.get(id).map(|room| room.video).unwrap_or(false),
                    selected: self.is_joined() && self.current_room.as_deref() == Some(id),
                })
                .collect(),
            phase: self.phase,
            current_room: self.current_room.clone(),
            server_room: self.server_room.clone(),
            reason: self.blocked_reason.clone(),
        }
    }

    pub fn scene_event(&self, rooms: &RoomRegistry) -> SceneEvent {
        let room = self.active_room(rooms);
        SceneEvent {
            room: room.id.clone(),
            background: room.background.clone(),
            canvas_visible: !room.video,
            elements: self.elements.clone(),
        }
    }

    pub fn players_event(&self, rooms: &RoomRegistry) -> PlayersEvent {
        let listener = match self.listener_id.as_ref() {
            Some(id) if self.is_joined() && self.active_room(rooms).video => id,
            _ => return PlayersEvent::default(),
        };

        let mut tiles = vec![PlayerTile {
            id: listener.clone(),
            target: LOCAL_PLAYER.to_string(),
            name: self.display_name(listener),
        }];
        tiles.extend(self.players.iter().map(|id| PlayerTile {
            id: id.clone(),
            target: remote_player_target(id),
            name: self.display_name(id),
        }));
        PlayersEvent { tiles }
    }
}
