use pedalcore::camera::FrameSource;
use pedalcore::processing::frame::{Frame, CHANNELS};
use pedalcore::zones::{complete_pairs, DetectionZone};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Shape of the synthetic pedaling seen by the camera.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub width: usize,
    pub height: usize,
    pub cadence_rpm: f32,
    pub in_phase: bool,
    pub frame_interval_ms: f64,
    pub stop_after_ms: Option<f64>,
    pub noise: u8,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            cadence_rpm: 60.0,
            in_phase: false,
            frame_interval_ms: 1_000.0 / 30.0,
            stop_after_ms: None,
            noise: 6,
            seed: 0,
        }
    }
}

const BACKGROUND: u8 = 40;
const LEG_BRIGHT: u8 = 235;
const LEG_DIM: u8 = 150;

/// Camera that films a rider pedaling at a fixed cadence.
///
/// Each pair's leg sits in the top zone for half a revolution and in the
/// bottom zone for the other half. The leg patch shimmers between two levels
/// every frame so the occupied zone keeps producing motion. In the two-pair
/// layout the second leg runs half a revolution behind the first unless
/// `in_phase` is set.
pub struct SyntheticPedalCamera {
    config: GeneratorConfig,
    zones: Vec<DetectionZone>,
    rng: StdRng,
    frame_index: u64,
}

impl SyntheticPedalCamera {
    pub fn new(config: GeneratorConfig, zones: Vec<DetectionZone>) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            zones,
            rng,
            frame_index: 0,
        }
    }

    /// Milliseconds of virtual time covered by the frames produced so far.
    pub fn clock_ms(&self) -> f64 {
        self.frame_index as f64 * self.config.frame_interval_ms
    }

    fn half_stroke_ms(&self) -> Option<f64> {
        if self.config.cadence_rpm <= 0.0 {
            None
        } else {
            Some(30_000.0 / f64::from(self.config.cadence_rpm))
        }
    }

    fn pedaling_at(&self, t_ms: f64) -> bool {
        self.config.stop_after_ms.map_or(true, |stop| t_ms < stop)
    }

    /// Pixel bounds of the zones the legs occupy at `t_ms`.
    fn lit_bounds(&self, t_ms: f64) -> Vec<(usize, usize, usize, usize)> {
        let Some(half_stroke) = self.half_stroke_ms() else {
            return Vec::new();
        };
        if !self.pedaling_at(t_ms) {
            return Vec::new();
        }
        let first_half = ((t_ms / half_stroke) as u64) % 2 == 0;
        let mut bounds = Vec::new();
        for (ordinal, (_, pair)) in complete_pairs(&self.zones).into_iter().enumerate() {
            let lagging = ordinal % 2 == 1 && !self.config.in_phase;
            let top_lit = first_half != lagging;
            let index = if top_lit { pair.top } else { pair.bottom };
            if let Some(zone) = index.and_then(|i| self.zones.get(i)) {
                bounds.push(
                    zone.rect
                        .pixel_bounds(self.config.width, self.config.height),
                );
            }
        }
        bounds
    }

    /// Renders the frame at `t_ms` without advancing the internal clock.
    pub fn render(&mut self, t_ms: f64) -> Option<Frame> {
        let (width, height) = (self.config.width, self.config.height);
        let lit = self.lit_bounds(t_ms);
        let leg = if self.frame_index % 2 == 0 {
            LEG_BRIGHT
        } else {
            LEG_DIM
        };
        let noise = i16::from(self.config.noise);
        let mut data = Vec::with_capacity(width * height * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                let on_leg = lit
                    .iter()
                    .any(|&(x0, y0, x1, y1)| x >= x0 && x < x1 && y >= y0 && y < y1);
                let base = if on_leg { leg } else { BACKGROUND };
                let jitter = if noise > 0 {
                    self.rng.gen_range(-noise..=noise)
                } else {
                    0
                };
                let value = (i16::from(base) + jitter).clamp(0, 255) as u8;
                data.extend_from_slice(&[value, value, value, 255]);
            }
        }
        Frame::from_rgba(width, height, data).ok()
    }
}

impl FrameSource for SyntheticPedalCamera {
    fn next_frame(&mut self) -> Option<Frame> {
        let t_ms = self.clock_ms();
        let frame = self.render(t_ms);
        self.frame_index += 1;
        frame
    }

    fn label(&self) -> &str {
        "synthetic-pedal"
    }
}

/// Camera pointed at an empty room: only sensor noise.
pub struct StaticCamera {
    width: usize,
    height: usize,
    noise: u8,
    rng: StdRng,
}

impl StaticCamera {
    pub fn new(width: usize, height: usize, noise: u8, seed: u64) -> Self {
        Self {
            width,
            height,
            noise,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl FrameSource for StaticCamera {
    fn next_frame(&mut self) -> Option<Frame> {
        let noise = i16::from(self.noise);
        let mut data = Vec::with_capacity(self.width * self.height * CHANNELS);
        for _ in 0..self.width * self.height {
            let jitter = if noise > 0 {
                self.rng.gen_range(-noise..=noise)
            } else {
                0
            };
            let value = (i16::from(BACKGROUND) + jitter).clamp(0, 255) as u8;
            data.extend_from_slice(&[value, value, value, 255]);
        }
        Frame::from_rgba(self.width, self.height, data).ok()
    }

    fn label(&self) -> &str {
        "local-webcam"
    }
}
