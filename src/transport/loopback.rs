//! In-process message bus
//!
//! Connects several control loops in one process, for tests and for running
//! more than one simulated unit. Envelopes go through the real codec so the
//! size limit and wire format are exercised too.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

use super::{Inbox, Transport, INBOX_CAPACITY};
use crate::error::TransportError;
use crate::protocol::{Envelope, UnitId};

#[derive(Default)]
struct Bus {
    members: Vec<(UnitId, Sender<Envelope>)>,
    /// Units whose outgoing traffic is lost
    muted: BTreeSet<UnitId>,
    #[cfg(test)]
    history: Vec<Envelope>,
}

#[derive(Clone, Default)]
pub struct LoopbackBus {
    bus: Arc<Mutex<Bus>>,
}

pub struct LoopbackTransport {
    unit: UnitId,
    bus: Arc<Mutex<Bus>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a unit; it receives everything the other units broadcast
    pub fn join(&self, unit: UnitId) -> (LoopbackTransport, Inbox) {
        let (tx, rx) = channel::bounded(INBOX_CAPACITY);
        self.bus.lock().members.push((unit, tx));
        (
            LoopbackTransport {
                unit,
                bus: Arc::clone(&self.bus),
            },
            rx,
        )
    }

    /// Drop everything `unit` sends until unmuted
    pub fn mute(&self, unit: UnitId, muted: bool) {
        let mut bus = self.bus.lock();
        if muted {
            bus.muted.insert(unit);
        } else {
            bus.muted.remove(&unit);
        }
    }

    /// Detach a unit; its transport fails with `Closed` from then on
    pub fn leave(&self, unit: UnitId) {
        self.bus.lock().members.retain(|(u, _)| *u != unit);
    }

    /// Every envelope delivered so far
    #[cfg(test)]
    pub fn history(&self) -> Vec<Envelope> {
        self.bus.lock().history.clone()
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn broadcast(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let decoded = Envelope::decode(&envelope.encode()?)?;

        let bus = self.bus.lock();
        if !bus.members.iter().any(|(unit, _)| *unit == self.unit) {
            return Err(TransportError::Closed);
        }
        if bus.muted.contains(&self.unit) {
            trace!("U{} muted, dropping {}", self.unit, decoded);
            return Ok(());
        }
        for (unit, tx) in &bus.members {
            if *unit != self.unit {
                let _ = tx.try_send(decoded.clone());
            }
        }
        #[cfg(test)]
        {
            let mut bus = bus;
            bus.history.push(decoded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JackAddr, MessageBody};
    use crate::transport::drain;

    #[test]
    fn test_delivers_to_everyone_but_sender() {
        let bus = LoopbackBus::new();
        let (t1, inbox1) = bus.join(1);
        let (_t2, inbox2) = bus.join(2);
        let (_t3, inbox3) = bus.join(3);

        let envelope = Envelope::new(1, MessageBody::Clear { source: JackAddr::new(1, 0) });
        t1.broadcast(&envelope).unwrap();

        assert!(drain(&inbox1).is_empty());
        assert_eq!(drain(&inbox2), vec![envelope.clone()]);
        assert_eq!(drain(&inbox3), vec![envelope.clone()]);
        assert_eq!(bus.history(), vec![envelope]);
    }

    #[test]
    fn test_muted_unit_is_unheard() {
        let bus = LoopbackBus::new();
        let (t1, _inbox1) = bus.join(1);
        let (_t2, inbox2) = bus.join(2);

        bus.mute(1, true);
        t1.broadcast(&Envelope::new(1, MessageBody::StateInquiry)).unwrap();
        assert!(drain(&inbox2).is_empty());
        assert!(bus.history().is_empty());
    }

    #[test]
    fn test_left_unit_cannot_send() {
        let bus = LoopbackBus::new();
        let (t1, _inbox1) = bus.join(1);
        let (_t2, inbox2) = bus.join(2);

        bus.leave(1);
        let result = t1.broadcast(&Envelope::new(1, MessageBody::StateInquiry));
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(drain(&inbox2).is_empty());
    }
}
