use serde::{Deserialize, Serialize};

/// Tunable constants shared by every processing stage.
///
/// Defaults are the empirically chosen values; a workflow file may override any
/// subset of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Mean channel difference (0-255 scale) above which a zone counts as active.
    pub motion_threshold: f32,
    /// Pixel stride used when sampling zone rectangles.
    pub sample_stride: usize,
    pub debounce_ms: f64,
    pub event_buffer_ms: f64,
    pub rpm_window_ms: f64,
    pub min_event_span_ms: f64,
    pub max_rpm: f32,
    /// Weight kept from the previous RPM on each smoothing step.
    pub rpm_smoothing: f32,
    pub idle_decay_after_ms: f64,
    pub idle_decay_step: f32,
    pub gear_multipliers: [f32; 3],
    pub acceleration_rate: f32,
    pub deceleration_rate: f32,
    pub inertia_reference_kg: f32,
    pub coast_base: f32,
    pub coast_speed_factor: f32,
    pub max_velocity_kmh: f32,
    pub stall_discard_ms: f64,
    pub max_dt_scale: f32,
    pub stop_velocity_kmh: f32,
    pub min_playback_rate: f64,
    pub max_playback_rate: f64,
    /// Velocity that plays the route video at 1.0x.
    pub reference_velocity_kmh: f32,
    pub broadcast_interval_ms: u64,
    pub negotiation_timeout_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 15.0,
            sample_stride: 4,
            debounce_ms: 250.0,
            event_buffer_ms: 5_000.0,
            rpm_window_ms: 3_000.0,
            min_event_span_ms: 200.0,
            max_rpm: 130.0,
            rpm_smoothing: 0.85,
            idle_decay_after_ms: 2_000.0,
            idle_decay_step: 1.0,
            gear_multipliers: [0.25, 0.35, 0.45],
            acceleration_rate: 0.06,
            deceleration_rate: 0.025,
            inertia_reference_kg: 85.0,
            coast_base: 0.02,
            coast_speed_factor: 0.003,
            max_velocity_kmh: 60.0,
            stall_discard_ms: 500.0,
            max_dt_scale: 3.0,
            stop_velocity_kmh: 0.5,
            min_playback_rate: 0.0625,
            max_playback_rate: 2.5,
            reference_velocity_kmh: 20.0,
            broadcast_interval_ms: 1_000,
            negotiation_timeout_ms: 30_000,
        }
    }
}

impl TuningConfig {
    /// Rejects combinations the stages cannot run with.
    pub fn validate(&self) -> RideResult<()> {
        let invalid = |message: &str| Err(RideError::InvalidInput(message.to_string()));
        if !(self.motion_threshold.is_finite() && self.motion_threshold >= 0.0) {
            return invalid("motion_threshold must be a non-negative number");
        }
        if self.sample_stride == 0 {
            return invalid("sample_stride must be positive");
        }
        if !(0.0..=1.0).contains(&self.rpm_smoothing) {
            return invalid("rpm_smoothing must be within [0, 1]");
        }
        if self.rpm_window_ms <= 0.0 || self.stall_discard_ms <= 0.0 {
            return invalid("rpm_window_ms and stall_discard_ms must be positive");
        }
        if !(self.min_playback_rate > 0.0 && self.min_playback_rate <= self.max_playback_rate) {
            return invalid("min_playback_rate must be positive and not above max_playback_rate");
        }
        if self.broadcast_interval_ms == 0 {
            return invalid("broadcast_interval_ms must be positive");
        }
        if self.negotiation_timeout_ms == 0 {
            return invalid("negotiation_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Common error type for the core.
///
/// Only resource and protocol failures surface here; signal insufficiency and
/// degenerate zone layouts are handled inside the stages.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RideError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid pairing transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("signaling failure: {0}")]
    Signaling(String),
    #[error("negotiation failure: {0}")]
    Negotiation(String),
    #[error("media failure: {0}")]
    Media(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type RideResult<T> = Result<T, RideError>;

/// Lifecycle shared by the per-tick processing stages.
pub trait ProcessingStage {
    fn name(&self) -> &'static str;
    fn initialize(&mut self, config: &TuningConfig);
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuning_is_valid() {
        assert!(TuningConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_playback_bounds_are_rejected() {
        let tuning = TuningConfig {
            min_playback_rate: 3.0,
            max_playback_rate: 2.5,
            ..TuningConfig::default()
        };
        assert!(matches!(tuning.validate(), Err(RideError::InvalidInput(_))));
    }

    #[test]
    fn smoothing_and_intervals_are_bounded() {
        let smoothing = TuningConfig {
            rpm_smoothing: 1.5,
            ..TuningConfig::default()
        };
        assert!(smoothing.validate().is_err());
        let broadcast = TuningConfig {
            broadcast_interval_ms: 0,
            ..TuningConfig::default()
        };
        assert!(broadcast.validate().is_err());
    }
}
