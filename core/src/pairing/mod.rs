//! Remote camera pairing and second-screen state mirroring.
//!
//! A primary device hosts a session under a short numeric code; a phone joins
//! with that code, negotiates a media link through the signaling relay and
//! streams its camera. The relay also carries the periodic ride snapshot for
//! passive viewers.

pub mod broadcast;
pub mod code;
pub mod media;
pub mod service;
pub mod signaling;
pub mod state;

pub use broadcast::{BroadcastHandle, StateBroadcaster};
pub use code::{CodeAllocator, SessionCode};
pub use media::{LoopbackConnector, LoopbackNetwork, PeerConnector};
pub use service::{ConnectorFactory, PairingHandle, PairingService};
pub use signaling::{InMemoryRelay, SignalEnvelope, SignalMessage, SignalingRelay};
pub use state::{PairingMachine, PairingRole, PairingState};
