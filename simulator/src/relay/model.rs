use pedalcore::pairing::signaling::MAILBOX_CAPACITY;
use pedalcore::pairing::{PairingRole, SignalEnvelope};
use pedalcore::RideSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Query string of the mailbox poll.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub after: u64,
}

/// Mailboxes of one code. Roles are present from their first poll until
/// they leave; messages for a role that left are dropped.
#[derive(Debug, Default)]
struct Room {
    mailboxes: HashMap<PairingRole, VecDeque<SignalEnvelope>>,
    present: Vec<PairingRole>,
    departed: Vec<PairingRole>,
}

/// Everything the relay server holds: per-code signaling rooms and the
/// latest mirrored snapshot per display code.
#[derive(Debug, Default)]
pub struct RelayStore {
    rooms: HashMap<String, Room>,
    states: HashMap<String, RideSnapshot>,
}

impl RelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the recipient already left and the message was dropped.
    pub fn publish(&mut self, envelope: SignalEnvelope) -> bool {
        let recipient = envelope.recipient();
        let room = self.rooms.entry(envelope.code.to_string()).or_default();
        if room.departed.contains(&recipient) {
            return false;
        }
        let mailbox = room.mailboxes.entry(recipient).or_default();
        if mailbox.len() == MAILBOX_CAPACITY {
            mailbox.pop_front();
        }
        mailbox.push_back(envelope);
        true
    }

    /// Messages for `role` with a sequence number above `after`. Polling marks
    /// the role present.
    pub fn poll(&mut self, code: &str, role: PairingRole, after: u64) -> Vec<SignalEnvelope> {
        let room = self.rooms.entry(code.to_string()).or_default();
        room.departed.retain(|departed| *departed != role);
        if !room.present.contains(&role) {
            room.present.push(role);
        }
        room.mailboxes
            .get(&role)
            .map(|mailbox| {
                mailbox
                    .iter()
                    .filter(|envelope| envelope.seq > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes `role` from `code`; the room goes once nobody is left in it.
    pub fn leave(&mut self, code: &str, role: PairingRole) -> bool {
        let Some(room) = self.rooms.get_mut(code) else {
            return false;
        };
        let had_mailbox = room.mailboxes.remove(&role).is_some();
        room.present.retain(|present| *present != role);
        if !room.departed.contains(&role) {
            room.departed.push(role);
        }
        if room.present.is_empty() {
            self.rooms.remove(code);
        }
        had_mailbox
    }

    pub fn open_codes(&self) -> usize {
        self.rooms.len()
    }

    pub fn set_state(&mut self, code: &str, snapshot: RideSnapshot) {
        self.states.insert(code.to_string(), snapshot);
    }

    pub fn state(&self, code: &str) -> Option<&RideSnapshot> {
        self.states.get(code)
    }

    pub fn clear_state(&mut self, code: &str) -> bool {
        self.states.remove(code).is_some()
    }
}
