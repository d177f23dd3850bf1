use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RoomBounds {
    pub width: f32,
    pub height: f32,
}

impl RoomBounds {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn min_x(&self) -> f32 {
        -self.width / 2.0
    }

    pub fn max_x(&self) -> f32 {
        self.width / 2.0
    }

    pub fn min_y(&self) -> f32 {
        -self.height / 2.0
    }

    pub fn max_y(&self) -> f32 {
        self.height / 2.0
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        (self.min_x()..=self.max_x()).contains(&x) && (self.min_y()..=self.max_y()).contains(&y)
    }
}

/// Room-space position as the audio engine sees it. `o` is the orientation
/// in radians.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct AudioPosition {
    pub x: f32,
    pub y: f32,
    pub o: f32,
}

impl AudioPosition {
    pub const fn new(x: f32, y: f32, o: f32) -> Self {
        Self { x, y, o }
    }
}

/// Canvas-normalized point: origin top-left, y grows downward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct CanvasPoint {
    pub x: f32,
    pub y: f32,
}

pub fn denormalize(normalized: f32, min: f32, max: f32) -> f32 {
    (max - min) * normalized + min
}

pub fn normalize(value: f32, min: f32, max: f32) -> f32 {
    let span = max - min;
    if span == 0.0 {
        return 0.0;
    }
    (value - min) / span
}

pub fn clamp(position: AudioPosition, bounds: RoomBounds) -> AudioPosition {
    AudioPosition {
        x: position.x.clamp(bounds.min_x(), bounds.max_x()),
        y: position.y.clamp(bounds.min_y(), bounds.max_y()),
        o: position.o,
    }
}

pub fn canvas_to_audio(point: CanvasPoint, bounds: RoomBounds) -> (f32, f32) {
    let x = (point.x - 0.5) * bounds.width;
    let y = -(point.y - 0.5) * bounds.height;
    (x, y)
}

pub fn audio_to_canvas(x: f32, y: f32, bounds: RoomBounds) -> CanvasPoint {
    CanvasPoint {
        x: 0.5 + x / bounds.width,
        y: 0.5 - y / bounds.height,
    }
}

/// The local participant's position. Stored as fractions of the room so it
/// survives a room switch; the getters reinterpret those fractions against
/// whatever bounds they are handed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CharacterPosition {
    pub nx: f32,
    pub ny: f32,
    pub o: f32,
}

impl CharacterPosition {
    pub const fn from_normalized(nx: f32, ny: f32, o: f32) -> Self {
        Self { nx, ny, o }
    }

    pub fn x(&self, bounds: RoomBounds) -> f32 {
        denormalize(self.nx, bounds.min_x(), bounds.max_x())
    }

    pub fn y(&self, bounds: RoomBounds) -> f32 {
        denormalize(self.ny, bounds.min_y(), bounds.max_y())
    }

    pub fn set_x(&mut self, x: f32, bounds: RoomBounds) {
        self.nx = normalize(x, bounds.min_x(), bounds.max_x());
    }

    pub fn set_y(&mut self, y: f32, bounds: RoomBounds) {
        self.ny = normalize(y, bounds.min_y(), bounds.max_y());
    }

    pub fn audio(&self, bounds: RoomBounds) -> AudioPosition {
        AudioPosition {
            x: self.x(bounds),
            y: self.y(bounds),
            o: self.o,
        }
    }

    pub fn set_from_audio(&mut self, position: AudioPosition, bounds: RoomBounds) {
        self.set_x(position.x, bounds);
        self.set_y(position.y, bounds);
        self.o = position.o;
    }

    pub fn canvas(&self, bounds: RoomBounds) -> CanvasPoint {
        audio_to_canvas(self.x(bounds), self.y(bounds), bounds)
    }

    /// Pulls the position back inside `bounds`. Must run after every drag
    /// before the listener position goes to the engine.
    pub fn clamp(&mut self, bounds: RoomBounds) {
        let clamped = clamp(self.audio(bounds), bounds);
        self.set_from_audio(clamped, bounds);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutTile {
    pub id: String,
    pub left: f32,
    pub right: f32,
}

/// Azimuth for each tile of a horizontal strip. Linear in the offset from
/// the strip centre, reaching +-pi/2 at the outer edges.
pub fn linear_azimuths(tiles: &[LayoutTile]) -> Vec<(String, f32)> {
    if tiles.is_empty() {
        return Vec::new();
    }

    let mut xmin = f32::INFINITY;
    let mut xmax = f32::NEG_INFINITY;
    for tile in tiles {
        xmin = xmin.min(tile.left);
        xmax = xmax.max(tile.right);
    }

    let xoff = (xmin + xmax) / 2.0;
    let half_span = xmax - xoff;

    tiles
        .iter()
        .map(|tile| {
            let centre = (tile.left + tile.right) / 2.0 - xoff;
            let azimuth = if half_span > 0.0 {
                FRAC_PI_2 * (centre / half_span)
            } else {
                0.0
            };
            (tile.id.clone(), azimuth)
        })
        .collect()
}
