pub mod layout;
pub mod model;

pub use layout::{remove_zone, update_zone_rect, CameraLayout};
pub use model::{
    complete_pairs, group_pairs, DetectionZone, ZonePair, ZonePosition, ZoneRect, ZoneSide,
};
