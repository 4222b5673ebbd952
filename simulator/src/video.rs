use pedalcore::processing::VideoHandle;
use pedalcore::{RideError, RideResult};

/// Stand-in for the route video element: tracks position and rate and can be
/// told to stall the way a browser pauses media in the background.
#[derive(Debug, Clone)]
pub struct SimulatedVideo {
    position_secs: f64,
    duration_secs: f64,
    rate: f64,
    paused: bool,
    ready: bool,
    refuse_play: bool,
}

impl SimulatedVideo {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            position_secs: 0.0,
            duration_secs,
            rate: 1.0,
            paused: true,
            ready: true,
            refuse_play: false,
        }
    }

    pub fn position_secs(&self) -> f64 {
        self.position_secs
    }

    pub fn stall(&mut self) {
        self.paused = true;
    }

    /// Makes every `play()` fail, like an autoplay policy rejection.
    pub fn set_refuse_play(&mut self, refuse: bool) {
        self.refuse_play = refuse;
    }

    /// Advances the playhead by `dt_ms` of wall time; loops at the end.
    pub fn advance(&mut self, dt_ms: f64) {
        if self.paused || dt_ms <= 0.0 {
            return;
        }
        self.position_secs += self.rate * dt_ms / 1_000.0;
        if self.duration_secs > 0.0 && self.position_secs >= self.duration_secs {
            self.position_secs %= self.duration_secs;
        }
    }
}

impl VideoHandle for SimulatedVideo {
    fn is_paused(&self) -> bool {
        self.paused
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    fn play(&mut self) -> RideResult<()> {
        if self.refuse_play {
            return Err(RideError::Media("play() rejected".to_string()));
        }
        self.paused = false;
        Ok(())
    }
}
