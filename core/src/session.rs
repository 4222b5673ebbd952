use crate::prelude::{ProcessingStage, RideError, RideResult, TuningConfig};
use crate::processing::{
    CadenceEstimator, Frame, MotionDetector, PhysicsEngine, PhysicsInput, PlaybackCommand,
    PlaybackSynchronizer, TickOutcome, VideoHandle,
};
use crate::profile::{Gear, RiderProfile};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use crate::zones::{remove_zone, update_zone_rect, CameraLayout, DetectionZone, ZoneRect};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RidePhase {
    #[default]
    Wizard,
    Riding,
    Paused,
    Finished,
}

/// Read-only view of the ride, published once per tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RideSnapshot {
    pub phase: RidePhase,
    pub step: u32,
    pub velocity_kmh: f32,
    pub rpm: f32,
    pub distance_km: f64,
    pub elapsed_ms: u64,
    pub gear: u8,
    pub max_velocity_kmh: f32,
}

/// End-of-ride figures handed to summarization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideSummary {
    pub elapsed_ms: u64,
    pub distance_km: f64,
    pub average_velocity_kmh: f32,
    pub max_velocity_kmh: f32,
    pub average_rpm: f32,
    pub pedal_events: usize,
    /// Flat-road estimate from the environment constants, not a measurement.
    pub estimated_average_watts: f32,
}

/// Simulation context for one ride: owns the zone layout and every stage.
///
/// `process_frame` runs motion then cadence observation; `tick` runs cadence
/// refresh, physics and the metric integrators. Both are synchronous and meant
/// to be called from the host's frame callback.
pub struct RideSession {
    tuning: TuningConfig,
    profile: RiderProfile,
    zones: Vec<DetectionZone>,
    detector: MotionDetector,
    cadence: CadenceEstimator,
    physics: PhysicsEngine,
    playback: PlaybackSynchronizer,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
    phase: RidePhase,
    step: u32,
    distance_km: f64,
    elapsed_ms: f64,
    max_velocity_kmh: f32,
    last_tick_ms: Option<f64>,
    rpm_total: f64,
    watts_total: f64,
    riding_ticks: u64,
    snapshots: watch::Sender<RideSnapshot>,
}

impl RideSession {
    pub fn new(profile: RiderProfile, tuning: TuningConfig, zones: Vec<DetectionZone>) -> Self {
        let (snapshots, _) = watch::channel(RideSnapshot::default());
        let profile = profile.sanitized();
        let mut session = Self {
            detector: MotionDetector::new(&tuning),
            cadence: CadenceEstimator::new(&tuning),
            physics: PhysicsEngine::new(&tuning),
            playback: PlaybackSynchronizer::new(&tuning),
            tuning,
            profile,
            zones,
            metrics: Arc::new(MetricsRecorder::new()),
            logger: LogManager::new("session"),
            phase: RidePhase::Wizard,
            step: 0,
            distance_km: 0.0,
            elapsed_ms: 0.0,
            max_velocity_kmh: 0.0,
            last_tick_ms: None,
            rpm_total: 0.0,
            watts_total: 0.0,
            riding_ticks: 0,
            snapshots,
        };
        session.publish();
        session
    }

    pub fn with_layout(profile: RiderProfile, tuning: TuningConfig, layout: CameraLayout) -> Self {
        Self::new(profile, tuning, layout.default_zones())
    }

    fn stages_mut(&mut self) -> [&mut dyn ProcessingStage; 4] {
        [
            &mut self.detector,
            &mut self.cadence,
            &mut self.physics,
            &mut self.playback,
        ]
    }

    /// Applies new tuning to every stage without resetting ride progress.
    pub fn retune(&mut self, tuning: TuningConfig) -> RideResult<()> {
        tuning.validate()?;
        let mut retuned = Vec::new();
        for stage in self.stages_mut() {
            stage.initialize(&tuning);
            retuned.push(stage.name());
        }
        self.tuning = tuning;
        self.logger
            .record(&format!("tuning applied to {}", retuned.join(", ")));
        Ok(())
    }

    pub fn phase(&self) -> RidePhase {
        self.phase
    }

    pub fn zones(&self) -> &[DetectionZone] {
        &self.zones
    }

    pub fn profile(&self) -> &RiderProfile {
        &self.profile
    }

    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn rpm(&self) -> f32 {
        self.cadence.rpm()
    }

    pub fn velocity(&self) -> f32 {
        self.physics.velocity()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RideSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn set_layout(&mut self, layout: CameraLayout) {
        self.logger.record(&format!("camera layout {:?}", layout));
        self.zones = layout.default_zones();
    }

    /// Zone editor: moves or resizes zone `id`.
    pub fn resize_zone(&mut self, id: u32, rect: ZoneRect) -> RideResult<()> {
        update_zone_rect(&mut self.zones, id, rect)
    }

    /// Zone editor: deletes zone `id`. A pair left without its partner stops
    /// contributing to cadence.
    pub fn delete_zone(&mut self, id: u32) -> Option<DetectionZone> {
        remove_zone(&mut self.zones, id)
    }

    pub fn set_profile(&mut self, profile: RiderProfile) {
        self.profile = profile.sanitized();
        self.publish();
    }

    pub fn set_gear(&mut self, gear: Gear) {
        self.profile.gear = gear;
    }

    /// Setup-wizard step mirrored to the second screen.
    pub fn set_step(&mut self, step: u32) {
        self.step = step;
        self.publish();
    }

    pub fn start(&mut self, now_ms: f64) -> RideResult<()> {
        if self.phase != RidePhase::Wizard {
            return Err(self.phase_error("start"));
        }
        for stage in self.stages_mut() {
            stage.reset();
        }
        self.distance_km = 0.0;
        self.elapsed_ms = 0.0;
        self.max_velocity_kmh = 0.0;
        self.rpm_total = 0.0;
        self.watts_total = 0.0;
        self.riding_ticks = 0;
        self.physics.prime(now_ms);
        self.last_tick_ms = Some(now_ms);
        self.phase = RidePhase::Riding;
        self.logger.record("ride started");
        self.publish();
        Ok(())
    }

    pub fn pause(&mut self, _now_ms: f64) -> RideResult<()> {
        if self.phase != RidePhase::Riding {
            return Err(self.phase_error("pause"));
        }
        self.phase = RidePhase::Paused;
        self.publish();
        Ok(())
    }

    /// Resumes riding; the paused interval counts neither as elapsed time nor
    /// as a physics stall.
    pub fn resume(&mut self, now_ms: f64) -> RideResult<()> {
        if self.phase != RidePhase::Paused {
            return Err(self.phase_error("resume"));
        }
        self.physics.prime(now_ms);
        self.last_tick_ms = Some(now_ms);
        self.reset_motion("resume");
        self.phase = RidePhase::Riding;
        self.publish();
        Ok(())
    }

    /// The camera now delivers frames from a different source; the next frame
    /// must not be diffed against the old one.
    pub fn camera_source_changed(&mut self) {
        self.reset_motion("camera source change");
    }

    fn reset_motion(&mut self, cause: &str) {
        self.detector.reset();
        self.logger.trace(&format!(
            "{} frame window cleared on {}",
            self.detector.name(),
            cause
        ));
    }

    pub fn finish(&mut self, _now_ms: f64) -> RideResult<RideSummary> {
        if !matches!(self.phase, RidePhase::Riding | RidePhase::Paused) {
            return Err(self.phase_error("finish"));
        }
        self.phase = RidePhase::Finished;
        self.publish();
        let summary = self.summary();
        self.logger.record(&format!(
            "ride finished: {:.2} km in {} s",
            summary.distance_km,
            summary.elapsed_ms / 1000
        ));
        Ok(summary)
    }

    fn phase_error(&self, action: &str) -> RideError {
        RideError::InvalidInput(format!("cannot {} while {:?}", action, self.phase))
    }

    /// Feeds one camera frame through the motion detector and cadence
    /// estimator. Returns the number of half-cycles recorded.
    pub fn process_frame(&mut self, frame: Frame, now_ms: f64) -> usize {
        if matches!(self.phase, RidePhase::Paused | RidePhase::Finished) {
            return 0;
        }
        let analyzed = self.detector.analyze(frame, &mut self.zones);
        self.metrics.record_frame(analyzed);
        if !analyzed {
            return 0;
        }
        let recorded = self.cadence.observe(&self.zones, now_ms);
        if recorded > 0 {
            self.metrics.record_pedal_events(recorded);
        }
        recorded
    }

    /// Advances cadence decay, physics and ride metrics to `now_ms`.
    pub fn tick(&mut self, now_ms: f64) -> RideSnapshot {
        if self.phase == RidePhase::Wizard {
            self.cadence.refresh(now_ms);
        }
        if self.phase != RidePhase::Riding {
            return self.publish();
        }

        let rpm = self.cadence.refresh(now_ms);
        let input = PhysicsInput::from_profile(rpm, &self.profile);
        let outcome = self.physics.step(&input, now_ms);
        if outcome == TickOutcome::Discarded {
            self.metrics.record_stall();
            self.logger.trace(&format!("discarded stalled tick at {:.0} ms", now_ms));
        }

        if let Some(last) = self.last_tick_ms {
            let dt_ms = now_ms - last;
            if dt_ms > 0.0 && dt_ms <= self.tuning.stall_discard_ms {
                let velocity = self.physics.velocity();
                self.elapsed_ms += dt_ms;
                self.distance_km += f64::from(velocity) * dt_ms / 3_600_000.0;
                self.max_velocity_kmh = self.max_velocity_kmh.max(velocity);
                self.rpm_total += f64::from(rpm);
                self.watts_total += f64::from(
                    self.physics
                        .environment()
                        .resistive_power_watts(velocity, self.profile.total_mass_kg()),
                );
                self.riding_ticks += 1;
            }
        }
        self.last_tick_ms = Some(now_ms);
        self.publish()
    }

    /// Drives the route video from the current velocity.
    pub fn sync_video(&mut self, video: &mut dyn VideoHandle) -> PlaybackCommand {
        let riding = self.phase == RidePhase::Riding;
        let velocity = self.physics.velocity();
        self.playback.apply(velocity, riding, video)
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback.rate_for(self.physics.velocity())
    }

    /// Times the route video had to be restarted while riding.
    pub fn video_restarts(&self) -> usize {
        self.playback.resumes()
    }

    pub fn snapshot(&self) -> RideSnapshot {
        RideSnapshot {
            phase: self.phase,
            step: self.step,
            velocity_kmh: self.physics.velocity(),
            rpm: self.cadence.rpm(),
            distance_km: self.distance_km,
            elapsed_ms: self.elapsed_ms.max(0.0) as u64,
            gear: self.profile.gear.level(),
            max_velocity_kmh: self.max_velocity_kmh,
        }
    }

    pub fn summary(&self) -> RideSummary {
        let hours = self.elapsed_ms / 3_600_000.0;
        let ticks = self.riding_ticks.max(1) as f64;
        RideSummary {
            elapsed_ms: self.elapsed_ms as u64,
            distance_km: self.distance_km,
            average_velocity_kmh: if hours > 0.0 {
                (self.distance_km / hours) as f32
            } else {
                0.0
            },
            max_velocity_kmh: self.max_velocity_kmh,
            average_rpm: (self.rpm_total / ticks) as f32,
            pedal_events: self.cadence.total_events(),
            estimated_average_watts: (self.watts_total / ticks) as f32,
        }
    }

    fn publish(&self) -> RideSnapshot {
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }
}
