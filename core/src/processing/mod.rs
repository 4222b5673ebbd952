pub mod cadence;
pub mod frame;
pub mod motion;
pub mod physics;
pub mod playback;

pub use cadence::{CadenceEstimator, PedalEvent};
pub use frame::{Frame, FrameWindow};
pub use motion::{zone_motion, MotionDetector};
pub use physics::{PhysicsEngine, PhysicsEnvironment, PhysicsInput, PhysicsState, TickOutcome};
pub use playback::{PlaybackCommand, PlaybackSynchronizer, VideoHandle};
