use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vertical role of a zone inside its pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ZonePosition {
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ZoneSide {
    Left,
    Right,
}

/// Rectangle expressed as fractions of the frame size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ZoneRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ZoneRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamps the rectangle so it lies entirely inside the unit square.
    pub fn normalized(&self) -> Self {
        let x = finite_or_zero(self.x).clamp(0.0, 1.0);
        let y = finite_or_zero(self.y).clamp(0.0, 1.0);
        let width = finite_or_zero(self.width).clamp(0.0, 1.0 - x);
        let height = finite_or_zero(self.height).clamp(0.0, 1.0 - y);
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Pixel bounds `(x0, y0, x1, y1)` (exclusive end) inside a frame.
    pub fn pixel_bounds(&self, frame_width: usize, frame_height: usize) -> (usize, usize, usize, usize) {
        let rect = self.normalized();
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x0 = ((rect.x * fw).floor() as usize).min(frame_width);
        let y0 = ((rect.y * fh).floor() as usize).min(frame_height);
        let x1 = (((rect.x + rect.width) * fw).ceil() as usize).clamp(x0, frame_width);
        let y1 = (((rect.y + rect.height) * fh).ceil() as usize).clamp(y0, frame_height);
        (x0, y0, x1, y1)
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// A user-placed region of interest watched by the motion detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionZone {
    pub id: u32,
    pub rect: ZoneRect,
    pub pair: u32,
    pub position: ZonePosition,
    pub side: ZoneSide,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub motion_level: f32,
}

impl DetectionZone {
    pub fn new(id: u32, rect: ZoneRect, pair: u32, position: ZonePosition, side: ZoneSide) -> Self {
        Self {
            id,
            rect,
            pair,
            position,
            side,
            active: false,
            motion_level: 0.0,
        }
    }
}

/// Indices of the two members of one leg's detection channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZonePair {
    pub top: Option<usize>,
    pub bottom: Option<usize>,
}

impl ZonePair {
    pub fn is_complete(&self) -> bool {
        self.top.is_some() && self.bottom.is_some()
    }
}

/// Groups zones by pair id. Duplicate members keep the first zone seen.
pub fn group_pairs(zones: &[DetectionZone]) -> BTreeMap<u32, ZonePair> {
    let mut pairs: BTreeMap<u32, ZonePair> = BTreeMap::new();
    for (index, zone) in zones.iter().enumerate() {
        let entry = pairs.entry(zone.pair).or_default();
        let slot = match zone.position {
            ZonePosition::Top => &mut entry.top,
            ZonePosition::Bottom => &mut entry.bottom,
        };
        if slot.is_none() {
            *slot = Some(index);
        }
    }
    pairs
}

/// Pair ids that have both a top and a bottom member.
pub fn complete_pairs(zones: &[DetectionZone]) -> Vec<(u32, ZonePair)> {
    group_pairs(zones)
        .into_iter()
        .filter(|(_, pair)| pair.is_complete())
        .collect()
}
