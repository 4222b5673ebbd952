use crate::prelude::{RideError, RideResult};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Which end of the media link this device is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PairingRole {
    /// The phone whose camera streams frames.
    Sender,
    /// The primary device consuming the stream.
    Receiver,
}

impl PairingRole {
    pub fn peer(self) -> Self {
        match self {
            PairingRole::Sender => PairingRole::Receiver,
            PairingRole::Receiver => PairingRole::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairingRole::Sender => "sender",
            PairingRole::Receiver => "receiver",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sender" => Some(PairingRole::Sender),
            "receiver" => Some(PairingRole::Receiver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum PairingState {
    Idle,
    Waiting,
    PhoneJoined,
    Connecting,
    Connected,
    /// Negotiation or relay error, with a cause the UI can show.
    Failed(String),
    /// Closed by the user or by session teardown.
    Cancelled,
}

impl PairingState {
    pub fn label(&self) -> &'static str {
        match self {
            PairingState::Idle => "idle",
            PairingState::Waiting => "waiting",
            PairingState::PhoneJoined => "phone-joined",
            PairingState::Connecting => "connecting",
            PairingState::Connected => "connected",
            PairingState::Failed(_) => "failed",
            PairingState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Failed(_) | PairingState::Cancelled)
    }

    pub fn can_transition_to(&self, next: &PairingState) -> bool {
        use PairingState::*;
        match (self, next) {
            (Idle, Waiting) => true,
            (Waiting, PhoneJoined) => true,
            (PhoneJoined, Connecting) => true,
            (Connecting, Connected) => true,
            (Waiting | PhoneJoined | Connecting | Connected, Failed(_) | Cancelled) => true,
            _ => false,
        }
    }
}

/// Enforces the pairing lifecycle and publishes every transition.
pub struct PairingMachine {
    role: PairingRole,
    state: PairingState,
    updates: watch::Sender<PairingState>,
}

impl PairingMachine {
    pub fn new(role: PairingRole) -> (Self, watch::Receiver<PairingState>) {
        let (updates, receiver) = watch::channel(PairingState::Idle);
        (
            Self {
                role,
                state: PairingState::Idle,
                updates,
            },
            receiver,
        )
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn advance(&mut self, next: PairingState) -> RideResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(RideError::InvalidTransition {
                from: self.state.label().to_string(),
                to: next.label().to_string(),
            });
        }
        log::info!(
            "pairing {} {} -> {}",
            self.role.as_str(),
            self.state.label(),
            next.label()
        );
        self.state = next.clone();
        self.updates.send_replace(next);
        Ok(())
    }

    /// Moves to `failed` unless the session already ended.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() && self.state != PairingState::Idle {
            let _ = self.advance(PairingState::Failed(reason.into()));
        } else if self.state == PairingState::Idle {
            let reason = reason.into();
            log::warn!("pairing {} failed before start: {}", self.role.as_str(), reason);
            self.state = PairingState::Failed(reason.clone());
            self.updates.send_replace(PairingState::Failed(reason));
        }
    }
}
