use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use pedalcore::{CameraLayout, Gear, RiderProfile, TuningConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One synthetic ride: who rides, how the camera sees them, and how long.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub profile: RiderProfile,
    pub layout: CameraLayout,
    pub tuning: TuningConfig,
    pub cadence_rpm: f32,
    /// Light both legs together; the known degenerate two-pair setup.
    pub in_phase: bool,
    pub duration_secs: f32,
    /// Rider stops pedaling after this many seconds.
    pub stop_after_secs: Option<f32>,
    pub fps: u32,
    pub frame_width: usize,
    pub frame_height: usize,
    /// Per-pixel noise amplitude on the 0-255 scale.
    pub noise: u8,
    pub seed: u64,
    /// Ride times at which the route video stalls, like a backgrounded tab.
    pub video_stalls_secs: Vec<f32>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            profile: RiderProfile::default(),
            layout: CameraLayout::Side,
            tuning: TuningConfig::default(),
            cadence_rpm: 60.0,
            in_phase: false,
            duration_secs: 20.0,
            stop_after_secs: None,
            fps: 30,
            frame_width: 160,
            frame_height: 120,
            noise: 6,
            seed: 0,
            video_stalls_secs: Vec::new(),
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_args(cadence_rpm: f32, duration_secs: f32, layout: CameraLayout, gear: Gear) -> Self {
        Self {
            cadence_rpm,
            duration_secs,
            layout,
            profile: RiderProfile {
                gear,
                ..RiderProfile::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.fps > 0, "fps must be positive");
        anyhow::ensure!(
            self.frame_width > 0 && self.frame_height > 0,
            "frame size must be non-zero"
        );
        anyhow::ensure!(
            self.cadence_rpm.is_finite() && self.cadence_rpm >= 0.0,
            "cadence_rpm must be a non-negative number"
        );
        anyhow::ensure!(
            self.duration_secs.is_finite() && self.duration_secs > 0.0,
            "duration_secs must be positive"
        );
        anyhow::ensure!(
            self.video_stalls_secs
                .iter()
                .all(|secs| secs.is_finite() && *secs >= 0.0),
            "video_stalls_secs must be non-negative"
        );
        self.tuning.validate().context("invalid tuning")?;
        Ok(())
    }

    pub fn frame_interval_ms(&self) -> f64 {
        1_000.0 / f64::from(self.fps.max(1))
    }

    pub fn frame_count(&self) -> usize {
        (f64::from(self.duration_secs) * f64::from(self.fps)).round() as usize
    }

    pub fn to_generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            width: self.frame_width,
            height: self.frame_height,
            cadence_rpm: self.cadence_rpm,
            in_phase: self.in_phase,
            frame_interval_ms: self.frame_interval_ms(),
            stop_after_ms: self.stop_after_secs.map(|secs| f64::from(secs) * 1_000.0),
            noise: self.noise,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_sets_gear_and_layout() {
        let cfg = WorkflowConfig::from_args(80.0, 5.0, CameraLayout::Front, Gear::High);
        assert_eq!(cfg.profile.gear, Gear::High);
        assert_eq!(cfg.layout, CameraLayout::Front);
        assert_eq!(cfg.frame_count(), 150);
        assert_eq!(cfg.to_generator_config().cadence_rpm, 80.0);
    }

    #[test]
    fn config_load_reads_partial_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"layout: front\ncadence_rpm: 75\nprofile:\n  weight_kg: 90\n  gear: low\ntuning:\n  motion_threshold: 20\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.layout, CameraLayout::Front);
        assert_eq!(cfg.cadence_rpm, 75.0);
        assert_eq!(cfg.profile.weight_kg, 90.0);
        assert_eq!(cfg.profile.gear, Gear::Low);
        assert_eq!(cfg.profile.equipment_kg, 10.0);
        assert_eq!(cfg.tuning.motion_threshold, 20.0);
        assert_eq!(cfg.tuning.debounce_ms, 250.0);
    }

    #[test]
    fn config_load_rejects_inconsistent_tuning() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"tuning:\n  min_playback_rate: 3.0\n  max_playback_rate: 2.0\n")
            .unwrap();
        let path = temp.into_temp_path();
        let err = WorkflowConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("min_playback_rate"));
    }

    #[test]
    fn zero_broadcast_interval_is_rejected() {
        let mut cfg = WorkflowConfig::default();
        cfg.tuning.broadcast_interval_ms = 0;
        assert!(cfg.validate().is_err());
        cfg.tuning.broadcast_interval_ms = 500;
        cfg.tuning.rpm_smoothing = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_load_rejects_zero_fps() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"fps: 0\n").unwrap();
        let path = temp.into_temp_path();
        let err = WorkflowConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("fps"));
    }
}
