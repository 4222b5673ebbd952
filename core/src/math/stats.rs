pub struct StatsHelper;

impl StatsHelper {
    /// One exponential smoothing step; `retain` is the weight kept from `previous`.
    pub fn smooth(previous: f32, sample: f32, retain: f32) -> f32 {
        previous * retain + sample * (1.0 - retain)
    }

    /// Moves `current` toward `target` by `fraction` of the gap, never overshooting.
    pub fn approach(current: f32, target: f32, fraction: f32) -> f32 {
        current + (target - current) * fraction.clamp(0.0, 1.0)
    }
}
