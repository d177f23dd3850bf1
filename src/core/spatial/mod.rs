pub mod coords;
pub mod level;

pub use coords::{
    audio_to_canvas, canvas_to_audio, clamp, linear_azimuths, AudioPosition, CanvasPoint,
    CharacterPosition, LayoutTile, RoomBounds,
};
pub use level::{fast_log2, level_to_db, level_to_radius, MIN_RADIUS};
