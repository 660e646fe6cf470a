//! Session events surfaced to the game layer.
//!
//! Sessions push events while processing a tick; the owner drains them
//! afterwards and reacts (menus, sounds, chat window).

use std::collections::VecDeque;

use crate::error::DisconnectReason;
use crate::identity::NetId;
use crate::job::ValidationOutcome;
use crate::login::LoginDenied;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Login accepted (client) or a player finished joining (server).
    Connected { player: u8 },
    Disconnected {
        player: Option<u8>,
        reason: DisconnectReason,
        detail: String,
    },
    LoginDenied(LoginDenied),
    PlayerJoined { player: u8, username: String },
    PlayerLeft { player: u8 },
    Chat { text: String },
    /// A validation resolved. Denials are shown as a local sound, not a popup.
    JobValidated { job: NetId, outcome: ValidationOutcome },
    JobTakeAnswered { job: NetId, granted: bool },
    TickSynced { tick: u32 },
}

impl SessionEvent {
    /// Disconnect event for a transport or channel failure.
    pub fn disconnected(player: Option<u8>, reason: DisconnectReason, detail: impl Into<String>) -> Self {
        SessionEvent::Disconnected {
            player,
            reason,
            detail: detail.into(),
        }
    }
}

/// FIFO of events produced during one or more ticks.
#[derive(Debug)]
pub struct EventQueue<E> {
    events: VecDeque<E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, e: E) {
        self.events.push_back(e);
    }

    pub fn drain(&mut self) -> Vec<E> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
