use crate::prelude::{ProcessingStage, RideResult, TuningConfig};
use crate::telemetry::log::LogManager;

/// Adapter over the platform video element the route plays in.
pub trait VideoHandle {
    fn is_paused(&self) -> bool;
    fn is_ready(&self) -> bool;
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&mut self, rate: f64);
    fn play(&mut self) -> RideResult<()>;
}

/// What the video adapter should do this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackCommand {
    pub rate: f64,
    pub resume: bool,
}

/// Maps simulated velocity onto a playback-rate multiplier.
pub struct PlaybackSynchronizer {
    stop_velocity_kmh: f32,
    min_rate: f64,
    max_rate: f64,
    reference_velocity_kmh: f32,
    resumes: usize,
    logger: LogManager,
}

impl PlaybackSynchronizer {
    pub fn new(config: &TuningConfig) -> Self {
        let mut synchronizer = Self {
            stop_velocity_kmh: 0.0,
            min_rate: 0.0,
            max_rate: 0.0,
            reference_velocity_kmh: 1.0,
            resumes: 0,
            logger: LogManager::new("playback"),
        };
        synchronizer.initialize(config);
        synchronizer
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    /// Number of times a paused video was restarted mid-ride.
    pub fn resumes(&self) -> usize {
        self.resumes
    }

    pub fn rate_for(&self, velocity_kmh: f32) -> f64 {
        if !velocity_kmh.is_finite() || velocity_kmh < self.stop_velocity_kmh {
            return self.min_rate;
        }
        let rate = f64::from(velocity_kmh) / f64::from(self.reference_velocity_kmh.max(0.1));
        rate.clamp(self.min_rate, self.max_rate)
    }

    pub fn plan(&self, velocity_kmh: f32, ride_active: bool, video_paused: bool) -> PlaybackCommand {
        PlaybackCommand {
            rate: self.rate_for(velocity_kmh),
            resume: ride_active && video_paused,
        }
    }

    /// Applies the plan to `video`. A failed restart is logged and retried on the
    /// next tick rather than surfaced.
    pub fn apply(
        &mut self,
        velocity_kmh: f32,
        ride_active: bool,
        video: &mut dyn VideoHandle,
    ) -> PlaybackCommand {
        let command = self.plan(velocity_kmh, ride_active, video.is_paused());
        if (video.playback_rate() - command.rate).abs() > 1e-3 {
            video.set_playback_rate(command.rate);
        }
        if command.resume && video.is_ready() {
            match video.play() {
                Ok(()) => {
                    self.resumes += 1;
                    self.logger.trace("restarted stalled route video");
                }
                Err(err) => self.logger.warn(&format!("video restart failed: {}", err)),
            }
        }
        command
    }
}

impl ProcessingStage for PlaybackSynchronizer {
    fn name(&self) -> &'static str {
        "playback"
    }

    fn initialize(&mut self, config: &TuningConfig) {
        self.stop_velocity_kmh = config.stop_velocity_kmh;
        self.min_rate = config.min_playback_rate;
        self.max_rate = config.max_playback_rate.max(config.min_playback_rate);
        self.reference_velocity_kmh = config.reference_velocity_kmh;
    }

    fn reset(&mut self) {
        self.resumes = 0;
    }
}
