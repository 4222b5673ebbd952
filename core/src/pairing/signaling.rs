use super::code::SessionCode;
use super::state::PairingRole;
use crate::prelude::{RideError, RideResult};
use crate::session::RideSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Undelivered messages kept per mailbox before the oldest is dropped.
pub const MAILBOX_CAPACITY: usize = 64;

/// Negotiation metadata exchanged through the relay. Media never travels here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Join,
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    Leave { reason: String },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join => "join",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Leave { .. } => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub code: SessionCode,
    pub from: PairingRole,
    /// Per-sender sequence number, starting at 1.
    pub seq: u64,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn recipient(&self) -> PairingRole {
        self.from.peer()
    }
}

/// Low-bandwidth channel keyed by session code.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Opens the mailbox for `role`; anything published to it before the
    /// subscription is delivered first.
    async fn subscribe(
        &self,
        code: &SessionCode,
        role: PairingRole,
    ) -> RideResult<mpsc::UnboundedReceiver<SignalEnvelope>>;

    /// Delivers to the mailbox of the envelope's recipient.
    async fn publish(&self, envelope: SignalEnvelope) -> RideResult<()>;

    async fn unsubscribe(&self, code: &SessionCode, role: PairingRole) -> RideResult<()>;

    /// Replaces the mirrored ride snapshot for viewers of `code`.
    async fn push_state(&self, code: &SessionCode, snapshot: &RideSnapshot) -> RideResult<()>;

    /// Forgets the mirrored snapshot once the display code is cleared.
    async fn clear_state(&self, code: &SessionCode) -> RideResult<()>;
}

enum Mailbox {
    Pending(VecDeque<SignalEnvelope>),
    Live(mpsc::UnboundedSender<SignalEnvelope>),
}

impl Mailbox {
    fn deliver(&mut self, envelope: SignalEnvelope) {
        let envelope = match self {
            Mailbox::Live(sender) => match sender.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            Mailbox::Pending(_) => envelope,
        };
        if let Mailbox::Live(_) = self {
            // receiver went away without unsubscribing
            *self = Mailbox::Pending(VecDeque::new());
        }
        if let Mailbox::Pending(queue) = self {
            if queue.len() == MAILBOX_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(envelope);
        }
    }
}

/// Mailboxes of one session code. A role that unsubscribed stays recorded as
/// departed so late messages to it are dropped instead of queued.
#[derive(Default)]
struct Room {
    mailboxes: HashMap<PairingRole, Mailbox>,
    departed: Vec<PairingRole>,
}

impl Room {
    fn has_subscriber(&self) -> bool {
        self.mailboxes
            .values()
            .any(|mailbox| matches!(mailbox, Mailbox::Live(_)))
    }
}

/// In-process relay; also stands in for an unreachable relay in tests.
pub struct InMemoryRelay {
    rooms: Mutex<HashMap<SessionCode, Room>>,
    states: Mutex<HashMap<SessionCode, RideSnapshot>>,
    available: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn latest_state(&self, code: &SessionCode) -> Option<RideSnapshot> {
        self.states.lock().ok()?.get(code).cloned()
    }

    pub fn is_subscribed(&self, code: &SessionCode, role: PairingRole) -> bool {
        self.rooms
            .lock()
            .map(|rooms| {
                rooms
                    .get(code)
                    .and_then(|room| room.mailboxes.get(&role))
                    .map_or(false, |mailbox| matches!(mailbox, Mailbox::Live(_)))
            })
            .unwrap_or(false)
    }

    /// Codes that still hold mailboxes.
    pub fn open_codes(&self) -> usize {
        self.rooms.lock().map(|rooms| rooms.len()).unwrap_or(0)
    }

    fn ensure_available(&self) -> RideResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RideError::Signaling("relay unavailable".to_string()))
        }
    }
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> RideError {
    RideError::Internal("relay lock poisoned".to_string())
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn subscribe(
        &self,
        code: &SessionCode,
        role: PairingRole,
    ) -> RideResult<mpsc::UnboundedReceiver<SignalEnvelope>> {
        self.ensure_available()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock().map_err(poisoned)?;
        let room = rooms.entry(code.clone()).or_default();
        room.departed.retain(|departed| *departed != role);
        let previous = room.mailboxes.insert(role, Mailbox::Live(sender.clone()));
        if let Some(Mailbox::Pending(queue)) = previous {
            for envelope in queue {
                let _ = sender.send(envelope);
            }
        }
        Ok(receiver)
    }

    async fn publish(&self, envelope: SignalEnvelope) -> RideResult<()> {
        self.ensure_available()?;
        let recipient = envelope.recipient();
        log::debug!(
            "relay {} {} -> {} #{}",
            envelope.code,
            envelope.message.kind(),
            recipient.as_str(),
            envelope.seq
        );
        let mut rooms = self.rooms.lock().map_err(poisoned)?;
        let room = rooms.entry(envelope.code.clone()).or_default();
        if room.departed.contains(&recipient) {
            log::debug!(
                "relay {} dropped {} for departed {}",
                envelope.code,
                envelope.message.kind(),
                recipient.as_str()
            );
            return Ok(());
        }
        room.mailboxes
            .entry(recipient)
            .or_insert_with(|| Mailbox::Pending(VecDeque::new()))
            .deliver(envelope);
        Ok(())
    }

    async fn unsubscribe(&self, code: &SessionCode, role: PairingRole) -> RideResult<()> {
        self.ensure_available()?;
        let mut rooms = self.rooms.lock().map_err(poisoned)?;
        let Some(room) = rooms.get_mut(code) else {
            return Ok(());
        };
        room.mailboxes.remove(&role);
        if !room.departed.contains(&role) {
            room.departed.push(role);
        }
        if !room.has_subscriber() {
            rooms.remove(code);
        }
        Ok(())
    }

    async fn push_state(&self, code: &SessionCode, snapshot: &RideSnapshot) -> RideResult<()> {
        self.ensure_available()?;
        self.states
            .lock()
            .map_err(poisoned)?
            .insert(code.clone(), snapshot.clone());
        Ok(())
    }

    async fn clear_state(&self, code: &SessionCode) -> RideResult<()> {
        self.ensure_available()?;
        self.states.lock().map_err(poisoned)?.remove(code);
        Ok(())
    }
}
