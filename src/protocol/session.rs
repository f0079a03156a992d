//! Per-source negotiation sessions

use std::collections::BTreeSet;

use super::message::{JackAddr, SignalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// This unit broadcast a request for one of its outputs
    RequestPending,
    /// This unit has inputs flashing for someone else's request
    Offering,
    /// A local input is connected to the source
    Connected,
}

/// A negotiation in flight; only pending and offering sessions are stored
#[derive(Debug, Clone)]
pub struct ProtocolSession {
    pub source: JackAddr,
    pub signal: SignalType,
    pub state: SessionState,
    pub deadline_ms: u64,
    /// Local input jacks currently offered; for a request these are the
    /// compatible inputs on the requesting unit itself
    pub candidates: BTreeSet<u8>,
}

impl ProtocolSession {
    pub fn request(source: JackAddr, signal: SignalType, deadline_ms: u64, candidates: BTreeSet<u8>) -> Self {
        Self {
            source,
            signal,
            state: SessionState::RequestPending,
            deadline_ms,
            candidates,
        }
    }

    pub fn offer(source: JackAddr, signal: SignalType, deadline_ms: u64, candidates: BTreeSet<u8>) -> Self {
        Self {
            source,
            signal,
            state: SessionState::Offering,
            deadline_ms,
            candidates,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    pub fn offers(&self, jack: u8) -> bool {
        self.candidates.contains(&jack)
    }
}
