use crate::math::stats::StatsHelper;
use crate::prelude::{ProcessingStage, TuningConfig};
use crate::zones::{complete_pairs, DetectionZone, ZonePosition};
use std::collections::{BTreeMap, VecDeque};

/// One detected half-stroke for a zone pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PedalEvent {
    pub timestamp_ms: f64,
    pub pair: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct PairTracker {
    phase: Option<ZonePosition>,
    last_event_ms: Option<f64>,
}

/// Reconstructs half-strokes from zone activity and derives a smoothed RPM.
///
/// With two or more complete pairs only top-to-bottom transitions count, so
/// each leg contributes one event per revolution. Two legs reporting the same
/// phase (a misplaced camera) yield a wrong but bounded cadence; the estimator
/// does not try to detect that layout.
pub struct CadenceEstimator {
    debounce_ms: f64,
    buffer_ms: f64,
    window_ms: f64,
    min_span_ms: f64,
    max_rpm: f32,
    smoothing: f32,
    decay_after_ms: f64,
    decay_step: f32,
    trackers: BTreeMap<u32, PairTracker>,
    events: VecDeque<PedalEvent>,
    rpm: f32,
    total_events: usize,
}

impl CadenceEstimator {
    pub fn new(config: &TuningConfig) -> Self {
        let mut estimator = Self {
            debounce_ms: 0.0,
            buffer_ms: 0.0,
            window_ms: 0.0,
            min_span_ms: 0.0,
            max_rpm: 0.0,
            smoothing: 0.0,
            decay_after_ms: 0.0,
            decay_step: 0.0,
            trackers: BTreeMap::new(),
            events: VecDeque::new(),
            rpm: 0.0,
            total_events: 0,
        };
        estimator.initialize(config);
        estimator
    }

    pub fn rpm(&self) -> f32 {
        self.rpm
    }

    pub fn total_events(&self) -> usize {
        self.total_events
    }

    pub fn events(&self) -> impl Iterator<Item = &PedalEvent> {
        self.events.iter()
    }

    pub fn tracked_pairs(&self) -> usize {
        self.trackers.len()
    }

    /// Full per-frame update: record transitions, then recompute RPM.
    pub fn update(&mut self, zones: &[DetectionZone], now_ms: f64) -> f32 {
        self.observe(zones, now_ms);
        self.refresh(now_ms)
    }

    /// Records half-cycle events from the current zone state. Returns how many
    /// were recorded this tick.
    pub fn observe(&mut self, zones: &[DetectionZone], now_ms: f64) -> usize {
        let pairs = complete_pairs(zones);
        self.trackers
            .retain(|id, _| pairs.iter().any(|(pair_id, _)| pair_id == id));
        let multi_leg = pairs.len() >= 2;

        let mut recorded = 0;
        for (pair_id, pair) in pairs {
            let (Some(top_index), Some(bottom_index)) = (pair.top, pair.bottom) else {
                continue;
            };
            let top = &zones[top_index];
            let bottom = &zones[bottom_index];
            let tracker = self.trackers.entry(pair_id).or_default();

            if !top.active && !bottom.active {
                continue;
            }
            let phase = if top.motion_level > bottom.motion_level {
                ZonePosition::Top
            } else {
                ZonePosition::Bottom
            };

            let previous = tracker.phase.replace(phase);
            let Some(previous) = previous else {
                continue;
            };
            if previous == phase {
                continue;
            }
            let debounced = tracker
                .last_event_ms
                .map_or(true, |last| now_ms - last >= self.debounce_ms);
            let gated = !multi_leg || (previous == ZonePosition::Top && phase == ZonePosition::Bottom);
            if debounced && gated {
                tracker.last_event_ms = Some(now_ms);
                self.events.push_back(PedalEvent {
                    timestamp_ms: now_ms,
                    pair: pair_id,
                });
                recorded += 1;
            }
        }
        self.total_events += recorded;
        recorded
    }

    /// Prunes the event buffer, applies the windowed RPM update and idle decay.
    /// Safe to call on ticks without a new frame.
    pub fn refresh(&mut self, now_ms: f64) -> f32 {
        while let Some(event) = self.events.front() {
            if now_ms - event.timestamp_ms > self.buffer_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }

        let mut count = 0usize;
        let mut oldest = f64::INFINITY;
        let mut newest = f64::NEG_INFINITY;
        for event in self.events.iter() {
            if now_ms - event.timestamp_ms <= self.window_ms {
                count += 1;
                oldest = oldest.min(event.timestamp_ms);
                newest = newest.max(event.timestamp_ms);
            }
        }

        if count >= 2 {
            let span_ms = newest - oldest;
            if span_ms >= self.min_span_ms {
                let strokes_per_minute = (count - 1) as f64 / span_ms * 60_000.0;
                let raw_rpm = ((strokes_per_minute / 2.0) as f32).clamp(0.0, self.max_rpm);
                self.rpm = StatsHelper::smooth(self.rpm, raw_rpm, self.smoothing);
            }
        }

        let idle = self
            .events
            .back()
            .map_or(true, |last| now_ms - last.timestamp_ms > self.decay_after_ms);
        if idle {
            self.rpm = (self.rpm - self.decay_step).max(0.0);
        }

        self.rpm = self.rpm.clamp(0.0, self.max_rpm);
        self.rpm
    }
}

impl ProcessingStage for CadenceEstimator {
    fn name(&self) -> &'static str {
        "cadence"
    }

    fn initialize(&mut self, config: &TuningConfig) {
        self.debounce_ms = config.debounce_ms;
        self.buffer_ms = config.event_buffer_ms;
        self.window_ms = config.rpm_window_ms;
        self.min_span_ms = config.min_event_span_ms;
        self.max_rpm = config.max_rpm;
        self.smoothing = config.rpm_smoothing;
        self.decay_after_ms = config.idle_decay_after_ms;
        self.decay_step = config.idle_decay_step;
    }

    fn reset(&mut self) {
        self.trackers.clear();
        self.events.clear();
        self.rpm = 0.0;
        self.total_events = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::CameraLayout;

    const FRAME_MS: f64 = 1000.0 / 60.0;

    fn set_phase(zones: &mut [DetectionZone], pair: u32, phase: Option<ZonePosition>) {
        for zone in zones.iter_mut().filter(|zone| zone.pair == pair) {
            let lit = phase == Some(zone.position);
            zone.active = lit;
            zone.motion_level = if lit { 40.0 } else { 1.0 };
        }
    }

    fn alternating(t: f64, period_ms: f64, invert: bool) -> ZonePosition {
        let even = ((t / period_ms) as u64) % 2 == 0;
        if even != invert {
            ZonePosition::Top
        } else {
            ZonePosition::Bottom
        }
    }

    /// Drives the estimator at 60 Hz with a per-tick phase function.
    fn drive(
        estimator: &mut CadenceEstimator,
        zones: &mut [DetectionZone],
        from_ms: f64,
        until_ms: f64,
        mut phase_at: impl FnMut(u32, f64) -> Option<ZonePosition>,
    ) -> Vec<(f64, f32)> {
        let mut trace = Vec::new();
        let mut t = from_ms;
        while t <= until_ms {
            for pair in [1, 2] {
                set_phase(zones, pair, phase_at(pair, t));
            }
            trace.push((t, estimator.update(zones, t)));
            t += FRAME_MS;
        }
        trace
    }

    #[test]
    fn zero_zones_never_produce_cadence() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        for tick in 0..600 {
            assert_eq!(estimator.update(&[], tick as f64 * FRAME_MS), 0.0);
        }
        assert_eq!(estimator.total_events(), 0);
    }

    #[test]
    fn identical_inputs_produce_no_events() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        set_phase(&mut zones, 1, Some(ZonePosition::Top));
        for tick in 0..120 {
            estimator.update(&zones, tick as f64 * FRAME_MS);
        }
        assert_eq!(estimator.total_events(), 0);
    }

    #[test]
    fn single_pair_counts_every_alternation_after_baseline() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        let phases = [
            ZonePosition::Top,
            ZonePosition::Top,
            ZonePosition::Bottom,
            ZonePosition::Top,
            ZonePosition::Bottom,
        ];
        for (index, phase) in phases.iter().enumerate() {
            set_phase(&mut zones, 1, Some(*phase));
            estimator.observe(&zones, index as f64 * 300.0);
        }
        assert_eq!(estimator.total_events(), 3);
        let stamps: Vec<f64> = estimator.events().map(|event| event.timestamp_ms).collect();
        assert_eq!(stamps, vec![600.0, 900.0, 1_200.0]);
        assert!(estimator.events().all(|event| event.pair == 1));
    }

    #[test]
    fn transitions_inside_debounce_window_count_once() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        set_phase(&mut zones, 1, Some(ZonePosition::Top));
        estimator.observe(&zones, 0.0);
        set_phase(&mut zones, 1, Some(ZonePosition::Bottom));
        estimator.observe(&zones, 300.0);
        set_phase(&mut zones, 1, Some(ZonePosition::Top));
        estimator.observe(&zones, 400.0);
        assert_eq!(estimator.total_events(), 1);
    }

    #[test]
    fn idle_zones_hold_the_phase() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        set_phase(&mut zones, 1, Some(ZonePosition::Top));
        estimator.observe(&zones, 0.0);
        set_phase(&mut zones, 1, None);
        zones[1].motion_level = 5.0;
        estimator.observe(&zones, 400.0);
        set_phase(&mut zones, 1, Some(ZonePosition::Top));
        estimator.observe(&zones, 800.0);
        assert_eq!(estimator.total_events(), 0);
    }

    #[test]
    fn steady_single_pair_converges_to_sixty_rpm() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        let trace = drive(&mut estimator, &mut zones, 0.0, 10_000.0, |_, t| {
            Some(alternating(t, 500.0, false))
        });
        for (t, rpm) in trace {
            assert!((0.0..=130.0).contains(&rpm));
            if t >= 3_000.0 {
                assert!((rpm - 60.0).abs() < 3.0, "rpm {} at {}", rpm, t);
            }
        }
    }

    #[test]
    fn two_pairs_out_of_phase_converge_to_sixty_rpm() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Front.default_zones();
        drive(&mut estimator, &mut zones, 0.0, 10_000.0, |pair, t| {
            Some(alternating(t, 500.0, pair == 2))
        });
        assert_eq!(estimator.tracked_pairs(), 2);
        assert!((estimator.rpm() - 60.0).abs() < 3.0);
    }

    #[test]
    fn two_pairs_in_phase_stay_bounded() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Front.default_zones();
        let trace = drive(&mut estimator, &mut zones, 0.0, 10_000.0, |_, t| {
            Some(alternating(t, 500.0, false))
        });
        let peak = trace.iter().map(|(_, rpm)| *rpm).fold(0.0, f32::max);
        assert!(peak > 0.0);
        assert!(peak < 100.0, "in-phase legs reported {}", peak);
    }

    #[test]
    fn sudden_stop_decays_to_zero() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        drive(&mut estimator, &mut zones, 0.0, 6_000.0, |_, t| {
            Some(alternating(t, 375.0, false))
        });
        assert!((estimator.rpm() - 80.0).abs() < 4.0);

        let trace = drive(&mut estimator, &mut zones, 6_000.0 + FRAME_MS, 10_500.0, |_, _| None);
        let mut previous = f32::MAX;
        for (_, rpm) in &trace {
            assert!(*rpm <= previous + 1.0);
            previous = *rpm;
        }
        assert_eq!(estimator.rpm(), 0.0);
    }

    #[test]
    fn decay_runs_without_new_frames() {
        let mut estimator = CadenceEstimator::new(&TuningConfig::default());
        let mut zones = CameraLayout::Side.default_zones();
        drive(&mut estimator, &mut zones, 0.0, 4_000.0, |_, t| {
            Some(alternating(t, 500.0, false))
        });
        let mut t = 4_000.0;
        let mut ticks = 0;
        while estimator.rpm() > 0.0 {
            t += FRAME_MS;
            estimator.refresh(t);
            ticks += 1;
            assert!(ticks < 400, "cadence never wound down");
        }
    }
}
