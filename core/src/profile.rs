use crate::prelude::{RideError, RideResult};
use serde::{Deserialize, Serialize};

/// Discrete resistance level chosen by the rider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gear {
    Low,
    #[default]
    Medium,
    High,
}

impl Gear {
    pub const ALL: [Gear; 3] = [Gear::Low, Gear::Medium, Gear::High];

    pub fn from_level(level: u8) -> RideResult<Self> {
        match level {
            1 => Ok(Gear::Low),
            2 => Ok(Gear::Medium),
            3 => Ok(Gear::High),
            other => Err(RideError::InvalidInput(format!(
                "gear level {} outside 1..=3",
                other
            ))),
        }
    }

    /// 1-based level as shown to the rider.
    pub fn level(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn index(self) -> usize {
        match self {
            Gear::Low => 0,
            Gear::Medium => 1,
            Gear::High => 2,
        }
    }
}

/// Rider and equipment parameters supplied by the setup flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiderProfile {
    pub weight_kg: f32,
    pub height_cm: f32,
    pub equipment_kg: f32,
    /// Calibration multiplier between perceived effort and displayed speed.
    pub speed_scale: f32,
    pub gear: Gear,
}

impl Default for RiderProfile {
    fn default() -> Self {
        Self {
            weight_kg: 75.0,
            height_cm: 175.0,
            equipment_kg: 10.0,
            speed_scale: 1.0,
            gear: Gear::Medium,
        }
    }
}

impl RiderProfile {
    pub const MIN_SPEED_SCALE: f32 = 0.1;
    pub const MAX_SPEED_SCALE: f32 = 3.0;

    pub fn total_mass_kg(&self) -> f32 {
        (self.weight_kg.max(0.0) + self.equipment_kg.max(0.0)).max(1.0)
    }

    /// Copy with out-of-range values pulled back into usable bounds.
    pub fn sanitized(&self) -> Self {
        let speed_scale = if self.speed_scale.is_finite() {
            self.speed_scale
                .clamp(Self::MIN_SPEED_SCALE, Self::MAX_SPEED_SCALE)
        } else {
            1.0
        };
        Self {
            weight_kg: non_negative(self.weight_kg),
            height_cm: non_negative(self.height_cm),
            equipment_kg: non_negative(self.equipment_kg),
            speed_scale,
            gear: self.gear,
        }
    }
}

fn non_negative(value: f32) -> f32 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gear_levels_round_trip_and_reject_out_of_range() {
        for gear in Gear::ALL {
            assert_eq!(Gear::from_level(gear.level()).unwrap(), gear);
        }
        assert!(Gear::from_level(0).is_err());
        assert!(Gear::from_level(4).is_err());
    }

    #[test]
    fn sanitized_clamps_scale_and_mass() {
        let profile = RiderProfile {
            weight_kg: -5.0,
            equipment_kg: f32::NAN,
            speed_scale: 9.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(profile.speed_scale, RiderProfile::MAX_SPEED_SCALE);
        assert_eq!(profile.total_mass_kg(), 1.0);
    }
}
