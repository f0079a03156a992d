//! Message transport between units
//!
//! Sending is fire-and-forget: a failed send is reported to the caller,
//! which logs it and moves on. Received envelopes are queued on an
//! [`Inbox`] that the control loop drains at the start of every tick, so
//! protocol state is never touched from a socket callback.

pub mod loopback;
pub mod udp;

use crate::error::TransportError;
use crate::protocol::Envelope;

pub use loopback::{LoopbackBus, LoopbackTransport};
pub use udp::UdpTransport;

/// Inbound envelopes from other units, oldest first
pub type Inbox = crossbeam::channel::Receiver<Envelope>;

/// Capacity of the inbound queue; newer datagrams are dropped when full
pub const INBOX_CAPACITY: usize = 256;

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Send to every other unit without waiting
    fn broadcast(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Drain everything queued right now
pub fn drain(inbox: &Inbox) -> Vec<Envelope> {
    inbox.try_iter().collect()
}
