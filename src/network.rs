//! # Network Supervisor Records
//!
//! One record per configured peer system: the link state, the per-peer
//! receive state machine, and the keep-alive bookkeeping. The supervisor
//! logic itself, that is (re)connect sequencing, keep-alive probing and
//! teardown propagation, lives in the engine; this module owns the data.

use crate::receiver::Receiver;

/// Link state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Connecting,
    Up,
}

/// Per-peer supervisor record.
pub struct Network {
    pub system: String,
    pub state: LinkState,
    /// Incoming byte-stream state machine; replaced wholesale on every
    /// link establishment so a half-parsed frame cannot leak across
    /// connections.
    pub receiver: Receiver,
    /// A keep-alive probe is in flight and unanswered.
    pub keepalive_outstanding: bool,
}

impl Network {
    pub fn new(system: String) -> Self {
        Self {
            system,
            state: LinkState::Down,
            receiver: Receiver::new(),
            keepalive_outstanding: false,
        }
    }

    /// Reset per-connection state when the link comes up.
    pub fn on_established(&mut self) {
        self.state = LinkState::Up;
        self.receiver = Receiver::new();
        self.keepalive_outstanding = false;
    }
}
