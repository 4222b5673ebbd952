use crate::prelude::{RideError, RideResult};
use crate::zones::model::{DetectionZone, ZonePosition, ZoneRect, ZoneSide};
use serde::{Deserialize, Serialize};

/// Camera placement chosen by the rider during setup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraLayout {
    /// Camera beside the bike: one leg visible, one pair.
    Side,
    /// Camera in front of the bike: both legs visible, two pairs.
    Front,
    /// Zones placed by hand; starts empty.
    Manual,
}

impl CameraLayout {
    pub fn default_zones(self) -> Vec<DetectionZone> {
        match self {
            CameraLayout::Side => vec![
                DetectionZone::new(
                    1,
                    ZoneRect::new(0.35, 0.2, 0.3, 0.25),
                    1,
                    ZonePosition::Top,
                    ZoneSide::Left,
                ),
                DetectionZone::new(
                    2,
                    ZoneRect::new(0.35, 0.55, 0.3, 0.25),
                    1,
                    ZonePosition::Bottom,
                    ZoneSide::Left,
                ),
            ],
            CameraLayout::Front => vec![
                DetectionZone::new(
                    1,
                    ZoneRect::new(0.15, 0.2, 0.25, 0.25),
                    1,
                    ZonePosition::Top,
                    ZoneSide::Left,
                ),
                DetectionZone::new(
                    2,
                    ZoneRect::new(0.15, 0.55, 0.25, 0.25),
                    1,
                    ZonePosition::Bottom,
                    ZoneSide::Left,
                ),
                DetectionZone::new(
                    3,
                    ZoneRect::new(0.6, 0.2, 0.25, 0.25),
                    2,
                    ZonePosition::Top,
                    ZoneSide::Right,
                ),
                DetectionZone::new(
                    4,
                    ZoneRect::new(0.6, 0.55, 0.25, 0.25),
                    2,
                    ZonePosition::Bottom,
                    ZoneSide::Right,
                ),
            ],
            CameraLayout::Manual => Vec::new(),
        }
    }
}

/// Moves or resizes a zone in place, as the zone editor does on drag.
pub fn update_zone_rect(zones: &mut [DetectionZone], id: u32, rect: ZoneRect) -> RideResult<()> {
    let zone = zones
        .iter_mut()
        .find(|zone| zone.id == id)
        .ok_or_else(|| RideError::InvalidInput(format!("unknown zone {}", id)))?;
    zone.rect = rect.normalized();
    Ok(())
}

/// Removes a zone; the remaining member of its pair stops being counted.
pub fn remove_zone(zones: &mut Vec<DetectionZone>, id: u32) -> Option<DetectionZone> {
    let index = zones.iter().position(|zone| zone.id == id)?;
    Some(zones.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::model::complete_pairs;

    #[test]
    fn side_layout_has_one_pair_front_has_two() {
        assert_eq!(complete_pairs(&CameraLayout::Side.default_zones()).len(), 1);
        assert_eq!(complete_pairs(&CameraLayout::Front.default_zones()).len(), 2);
        assert!(CameraLayout::Manual.default_zones().is_empty());
    }

    #[test]
    fn update_zone_rect_normalizes_and_rejects_unknown_ids() {
        let mut zones = CameraLayout::Side.default_zones();
        update_zone_rect(&mut zones, 1, ZoneRect::new(0.9, 0.1, 0.4, 0.2)).unwrap();
        assert!((zones[0].rect.width - 0.1).abs() < 1e-6);
        assert!(update_zone_rect(&mut zones, 42, ZoneRect::new(0.0, 0.0, 0.1, 0.1)).is_err());
    }

    #[test]
    fn removing_a_member_breaks_the_pair() {
        let mut zones = CameraLayout::Side.default_zones();
        assert!(remove_zone(&mut zones, 2).is_some());
        assert!(complete_pairs(&zones).is_empty());
    }
}
