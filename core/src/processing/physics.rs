use crate::math::stats::StatsHelper;
use crate::prelude::{ProcessingStage, TuningConfig};
use crate::profile::{Gear, RiderProfile};
use serde::{Deserialize, Serialize};

/// Integration step the rate constants are expressed against (one 60 Hz frame).
const REFERENCE_FRAME_MS: f64 = 1000.0 / 60.0;

/// Environment constants for resistive-power estimates. The velocity model does
/// not use them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhysicsEnvironment {
    pub air_density: f32,
    pub drag_coefficient: f32,
    pub frontal_area_m2: f32,
    pub rolling_resistance: f32,
    pub gravity: f32,
    pub drivetrain_loss: f32,
}

impl Default for PhysicsEnvironment {
    fn default() -> Self {
        Self {
            air_density: 1.225,
            drag_coefficient: 0.88,
            frontal_area_m2: 0.5,
            rolling_resistance: 0.005,
            gravity: 9.81,
            drivetrain_loss: 0.03,
        }
    }
}

impl PhysicsEnvironment {
    /// Rough flat-road power needed to hold `velocity_kmh`. Not a power-meter
    /// reading.
    pub fn resistive_power_watts(&self, velocity_kmh: f32, total_mass_kg: f32) -> f32 {
        let v = velocity_kmh.max(0.0) / 3.6;
        let aero = 0.5 * self.air_density * self.drag_coefficient * self.frontal_area_m2 * v.powi(3);
        let rolling = self.rolling_resistance * total_mass_kg.max(0.0) * self.gravity * v;
        (aero + rolling) / (1.0 - self.drivetrain_loss).max(0.01)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhysicsState {
    pub velocity_kmh: f32,
    pub last_update_ms: Option<f64>,
}

/// Per-tick inputs, read from the cadence estimator and the rider profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsInput {
    pub rpm: f32,
    pub gear: Gear,
    pub speed_scale: f32,
    pub total_mass_kg: f32,
}

impl PhysicsInput {
    pub fn from_profile(rpm: f32, profile: &RiderProfile) -> Self {
        Self {
            rpm,
            gear: profile.gear,
            speed_scale: profile.speed_scale,
            total_mass_kg: profile.total_mass_kg(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// First tick after a reset; only the clock was armed.
    Primed,
    Integrated,
    /// Elapsed time exceeded the stall threshold; velocity left untouched.
    Discarded,
}

/// Cadence-to-velocity model with mass-dependent inertia and coasting.
pub struct PhysicsEngine {
    state: PhysicsState,
    environment: PhysicsEnvironment,
    gear_multipliers: [f32; 3],
    acceleration_rate: f32,
    deceleration_rate: f32,
    inertia_reference_kg: f32,
    coast_base: f32,
    coast_speed_factor: f32,
    max_velocity_kmh: f32,
    stall_discard_ms: f64,
    max_dt_scale: f32,
}

impl PhysicsEngine {
    pub fn new(config: &TuningConfig) -> Self {
        let mut engine = Self {
            state: PhysicsState::default(),
            environment: PhysicsEnvironment::default(),
            gear_multipliers: [0.0; 3],
            acceleration_rate: 0.0,
            deceleration_rate: 0.0,
            inertia_reference_kg: 0.0,
            coast_base: 0.0,
            coast_speed_factor: 0.0,
            max_velocity_kmh: 0.0,
            stall_discard_ms: 0.0,
            max_dt_scale: 0.0,
        };
        engine.initialize(config);
        engine
    }

    pub fn state(&self) -> PhysicsState {
        self.state
    }

    pub fn velocity(&self) -> f32 {
        self.state.velocity_kmh
    }

    pub fn environment(&self) -> &PhysicsEnvironment {
        &self.environment
    }

    /// Arms the clock at `now_ms` without integrating.
    pub fn prime(&mut self, now_ms: f64) {
        self.state.last_update_ms = Some(now_ms);
    }

    pub fn target_velocity(&self, input: &PhysicsInput) -> f32 {
        let multiplier = self.gear_multipliers[input.gear.index()];
        (input.rpm.max(0.0) * multiplier * input.speed_scale.max(0.0))
            .clamp(0.0, self.max_velocity_kmh)
    }

    pub fn step(&mut self, input: &PhysicsInput, now_ms: f64) -> TickOutcome {
        let Some(last) = self.state.last_update_ms else {
            self.prime(now_ms);
            return TickOutcome::Primed;
        };
        self.state.last_update_ms = Some(now_ms);

        let elapsed_ms = now_ms - last;
        if elapsed_ms > self.stall_discard_ms {
            return TickOutcome::Discarded;
        }
        if elapsed_ms <= 0.0 {
            return TickOutcome::Integrated;
        }

        let dt_scale = ((elapsed_ms / REFERENCE_FRAME_MS) as f32).min(self.max_dt_scale);
        let target = self.target_velocity(input);
        let inertia = self.inertia_reference_kg / input.total_mass_kg.max(1.0);
        let mut velocity = self.state.velocity_kmh;

        let base_rate = if target > velocity {
            self.acceleration_rate
        } else {
            self.deceleration_rate
        };
        velocity = StatsHelper::approach(velocity, target, inertia * base_rate * dt_scale);

        if input.rpm <= 0.0 && velocity > 0.0 {
            velocity -= (self.coast_base + velocity * self.coast_speed_factor) * dt_scale;
        }

        self.state.velocity_kmh = velocity.clamp(0.0, self.max_velocity_kmh);
        TickOutcome::Integrated
    }
}

impl ProcessingStage for PhysicsEngine {
    fn name(&self) -> &'static str {
        "physics"
    }

    fn initialize(&mut self, config: &TuningConfig) {
        self.gear_multipliers = config.gear_multipliers;
        self.acceleration_rate = config.acceleration_rate;
        self.deceleration_rate = config.deceleration_rate;
        self.inertia_reference_kg = config.inertia_reference_kg;
        self.coast_base = config.coast_base;
        self.coast_speed_factor = config.coast_speed_factor;
        self.max_velocity_kmh = config.max_velocity_kmh;
        self.stall_discard_ms = config.stall_discard_ms;
        self.max_dt_scale = config.max_dt_scale;
    }

    fn reset(&mut self) {
        self.state = PhysicsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_MS: f64 = 1000.0 / 60.0;

    fn input(rpm: f32) -> PhysicsInput {
        PhysicsInput::from_profile(rpm, &RiderProfile::default())
    }

    fn run(engine: &mut PhysicsEngine, input: &PhysicsInput, from_ms: f64, ticks: usize) -> f64 {
        let mut t = from_ms;
        for _ in 0..ticks {
            t += FRAME_MS;
            engine.step(input, t);
        }
        t
    }

    #[test]
    fn cold_start_is_stationary() {
        let mut engine = PhysicsEngine::new(&TuningConfig::default());
        assert_eq!(engine.step(&input(0.0), 0.0), TickOutcome::Primed);
        run(&mut engine, &input(0.0), 0.0, 60);
        assert_eq!(engine.velocity(), 0.0);
    }

    #[test]
    fn velocity_approaches_target() {
        let mut engine = PhysicsEngine::new(&TuningConfig::default());
        engine.prime(0.0);
        run(&mut engine, &input(60.0), 0.0, 600);
        let target = engine.target_velocity(&input(60.0));
        assert!((engine.velocity() - target).abs() < 0.5);
    }

    #[test]
    fn heavier_rider_responds_slower() {
        let mut light = PhysicsEngine::new(&TuningConfig::default());
        let mut heavy = PhysicsEngine::new(&TuningConfig::default());
        light.prime(0.0);
        heavy.prime(0.0);
        let mut light_input = input(80.0);
        light_input.total_mass_kg = 50.0;
        let mut heavy_input = input(80.0);
        heavy_input.total_mass_kg = 150.0;
        run(&mut light, &light_input, 0.0, 30);
        run(&mut heavy, &heavy_input, 0.0, 30);
        assert!(light.velocity() > heavy.velocity());
    }

    #[test]
    fn acceleration_outpaces_deceleration() {
        let config = TuningConfig::default();
        let mut rising = PhysicsEngine::new(&config);
        rising.prime(0.0);
        run(&mut rising, &input(60.0), 0.0, 1);
        let gained = rising.velocity();

        let mut falling = PhysicsEngine::new(&config);
        falling.state.velocity_kmh = falling.target_velocity(&input(60.0));
        falling.prime(0.0);
        let start = falling.velocity();
        run(&mut falling, &input(1.0e-3), 0.0, 1);
        assert!(gained > start - falling.velocity());
    }

    #[test]
    fn zero_cadence_coasts_down_gradually() {
        let mut engine = PhysicsEngine::new(&TuningConfig::default());
        engine.prime(0.0);
        let t = run(&mut engine, &input(80.0), 0.0, 900);
        let cruising = engine.velocity();
        assert!(cruising > 20.0);

        run(&mut engine, &input(0.0), t, 1);
        assert!(engine.velocity() > cruising * 0.9);
        run(&mut engine, &input(0.0), t + FRAME_MS, 1_200);
        assert_eq!(engine.velocity(), 0.0);
    }

    #[test]
    fn stalled_tick_is_discarded() {
        let mut engine = PhysicsEngine::new(&TuningConfig::default());
        engine.prime(0.0);
        let t = run(&mut engine, &input(70.0), 0.0, 120);
        let before = engine.velocity();
        assert_eq!(engine.step(&input(130.0), t + 2_000.0), TickOutcome::Discarded);
        assert_eq!(engine.velocity(), before);
    }

    #[test]
    fn velocity_stays_within_bounds_for_any_input() {
        let config = TuningConfig::default();
        for rpm in [0.0, 10.0, 65.0, 130.0] {
            for gear in Gear::ALL {
                for speed_scale in [0.1, 1.0, 3.0] {
                    for total_mass_kg in [40.0, 85.0, 300.0] {
                        let mut engine = PhysicsEngine::new(&config);
                        engine.prime(0.0);
                        let input = PhysicsInput {
                            rpm,
                            gear,
                            speed_scale,
                            total_mass_kg,
                        };
                        let mut t = 0.0;
                        for tick in 0..400 {
                            t += if tick % 50 == 0 { 499.0 } else { FRAME_MS };
                            engine.step(&input, t);
                            let v = engine.velocity();
                            assert!((0.0..=60.0).contains(&v), "velocity {} out of range", v);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn power_estimate_grows_with_speed() {
        let env = PhysicsEnvironment::default();
        assert_eq!(env.resistive_power_watts(0.0, 85.0), 0.0);
        assert!(env.resistive_power_watts(30.0, 85.0) > env.resistive_power_watts(20.0, 85.0));
    }
}
