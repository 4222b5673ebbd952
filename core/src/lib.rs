//! Optical cadence sensing and ride simulation core for PedalSight.
//!
//! Camera frames flow through the zone motion detector, the cadence estimator,
//! the physics engine and the playback synchronizer once per rendered frame.
//! The pairing module lets a second device's camera stand in for the local one
//! and mirrors ride state onto a passive viewer.

pub mod camera;
pub mod math;
pub mod pairing;
pub mod prelude;
pub mod processing;
pub mod profile;
pub mod session;
pub mod telemetry;
pub mod zones;

pub use prelude::{ProcessingStage, RideError, RideResult, TuningConfig};
pub use profile::{Gear, RiderProfile};
pub use session::{RidePhase, RideSession, RideSnapshot, RideSummary};
pub use zones::{CameraLayout, DetectionZone, ZonePosition, ZoneRect, ZoneSide};
