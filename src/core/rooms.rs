use std::f32::consts::PI;
use std::sync::OnceLock;

use serde::Serialize;

use super::spatial::{AudioPosition, RoomBounds};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AmbientSourceSpec {
    pub x: f32,
    pub y: f32,
    pub url: String,
    pub display_name: String,
}

impl AmbientSourceSpec {
    fn new(x: f32, y: f32, url: &str) -> Self {
        Self {
            x,
            y,
            url: url.to_string(),
            display_name: display_name_for_url(url),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoomSpec {
    pub id: String,
    pub video: bool,
    pub metadata: bool,
    pub seats: Vec<AudioPosition>,
    pub bounds: RoomBounds,
    pub background: String,
    pub ambient_groups: Vec<Vec<AmbientSourceSpec>>,
}

impl RoomSpec {
    pub fn seat(&self, nth: usize) -> Option<AudioPosition> {
        self.seats.get(nth).copied()
    }
}

pub struct RoomRegistry {
    rooms: Vec<RoomSpec>,
}

impl RoomRegistry {
    pub fn builtin() -> &'static RoomRegistry {
        static REGISTRY: OnceLock<RoomRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| RoomRegistry {
            rooms: builtin_rooms(),
        })
    }

    pub fn get(&self, room_id: &str) -> Option<&RoomSpec> {
        self.rooms.iter().find(|room| room.id == room_id)
    }

    pub fn first(&self) -> &RoomSpec {
        &self.rooms[0]
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(|room| room.id.as_str())
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.get(room_id).is_some()
    }
}

/// `sounds/campfire.wav` -> `campfire`
pub fn display_name_for_url(url: &str) -> String {
    let file = url.rsplit('/').next().unwrap_or(url);
    match file.rfind('.') {
        Some(dot) if dot > 0 => file[..dot].to_string(),
        _ => file.to_string(),
    }
}

fn deg(d: f32) -> f32 {
    PI * d / 180.0
}

fn builtin_rooms() -> Vec<RoomSpec> {
    vec![
        RoomSpec {
            id: "room-conf-table".to_string(),
            video: false,
            metadata: true,
            seats: vec![
                AudioPosition::new(0.0, -1.0, deg(0.0)),
                AudioPosition::new(1.0, 0.0, deg(270.0)),
                AudioPosition::new(0.0, 1.0, deg(180.0)),
                AudioPosition::new(-1.0, 0.0, deg(90.0)),
                AudioPosition::new(-0.707, -0.707, deg(45.0)),
                AudioPosition::new(-0.707, 0.707, deg(135.0)),
                AudioPosition::new(0.707, 0.707, deg(225.0)),
                AudioPosition::new(0.707, -0.707, deg(315.0)),
            ],
            bounds: RoomBounds::new(4.0, 4.0),
            background: "Table_semi-transparent_HF_Logo.svg".to_string(),
            ambient_groups: vec![vec![
                AmbientSourceSpec::new(-1.6, -1.6, "sounds/campfire.wav"),
                AmbientSourceSpec::new(-1.6, 1.6, "sounds/owl.wav"),
                AmbientSourceSpec::new(1.6, 1.6, "sounds/waterfall.wav"),
                AmbientSourceSpec::new(1.6, -1.6, "sounds/thunder.wav"),
            ]],
        },
        plain_room("room-quad-music", 8.0, false),
        plain_room("room-bar", 16.0, false),
        plain_room("room-video", 8.0, true),
    ]
}

fn plain_room(id: &str, size: f32, video: bool) -> RoomSpec {
    RoomSpec {
        id: id.to_string(),
        video,
        metadata: !video,
        seats: Vec::new(),
        bounds: RoomBounds::new(size, size),
        background: "Semi-transparent_HF_Logo.svg".to_string(),
        ambient_groups: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keeps_declaration_order() {
        let ids = RoomRegistry::builtin().ids().collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec!["room-conf-table", "room-quad-music", "room-bar", "room-video"]
        );
        assert_eq!(RoomRegistry::builtin().first().id, "room-conf-table");
    }

    #[test]
    fn only_video_room_lacks_metadata() {
        let registry = RoomRegistry::builtin();
        let video = registry.get("room-video").expect("video room");
        assert!(video.video);
        assert!(!video.metadata);
        assert!(registry.get("room-bar").expect("bar").metadata);
    }

    #[test]
    fn conference_table_has_eight_seats() {
        let room = RoomRegistry::builtin().get("room-conf-table").expect("room");
        assert_eq!(room.seats.len(), 8);
        let seat = room.seat(2).expect("seat 2");
        assert_eq!((seat.x, seat.y), (0.0, 1.0));
        assert!((seat.o - PI).abs() < 1e-6);
    }

    #[test]
    fn display_name_strips_directory_and_extension() {
        assert_eq!(display_name_for_url("sounds/campfire.wav"), "campfire");
        assert_eq!(display_name_for_url("owl"), "owl");
    }
}
