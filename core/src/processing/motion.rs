use crate::prelude::{ProcessingStage, TuningConfig};
use crate::processing::frame::{Frame, FrameWindow};
use crate::telemetry::log::LogManager;
use crate::zones::{DetectionZone, ZoneRect};
use ndarray::s;

/// Mean per-pixel RGB difference inside `rect`, sampled every `stride` pixels.
pub fn zone_motion(current: &Frame, previous: &Frame, rect: &ZoneRect, stride: usize) -> f32 {
    let (x0, y0, x1, y1) = rect.pixel_bounds(current.width(), current.height());
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }
    let step = stride.max(1) as isize;
    let current = current.pixels().slice(s![y0..y1;step, x0..x1;step, 0..3]);
    let previous = previous.pixels().slice(s![y0..y1;step, x0..x1;step, 0..3]);
    if current.is_empty() {
        return 0.0;
    }

    let total: u64 = current
        .iter()
        .zip(previous.iter())
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    total as f32 / current.len() as f32
}

/// Frame-differencing detector that scores every zone once per analyzed frame.
pub struct MotionDetector {
    threshold: f32,
    stride: usize,
    window: FrameWindow,
    logger: LogManager,
}

impl MotionDetector {
    pub fn new(config: &TuningConfig) -> Self {
        Self {
            threshold: config.motion_threshold,
            stride: config.sample_stride,
            window: FrameWindow::new(),
            logger: LogManager::new("motion"),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pushes `frame` into the window and rescores `zones` in place.
    ///
    /// Returns `false` when there is no comparable previous frame; zones then
    /// keep their prior state.
    pub fn analyze(&mut self, frame: Frame, zones: &mut [DetectionZone]) -> bool {
        self.window.push(frame);
        let Some((current, previous)) = self.window.pair() else {
            return false;
        };
        if !current.same_dimensions(previous) {
            self.logger.trace(&format!(
                "frame size changed to {}x{}, skipping",
                current.width(),
                current.height()
            ));
            return false;
        }

        for zone in zones.iter_mut() {
            let level = zone_motion(current, previous, &zone.rect, self.stride);
            zone.motion_level = level;
            zone.active = level > self.threshold;
        }
        true
    }
}

impl ProcessingStage for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn initialize(&mut self, config: &TuningConfig) {
        self.threshold = config.motion_threshold;
        self.stride = config.sample_stride;
    }

    fn reset(&mut self) {
        self.window.reset();
    }
}
