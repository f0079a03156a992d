//! Virtual patching protocol: wire messages, sessions and the per-unit engine

pub mod engine;
pub mod message;
pub mod session;

pub use engine::{JackIndicator, LocalJack, PatchProtocol, ProtocolEvent, ProtocolSettings};
pub use message::{Envelope, JackAddr, JackCapability, MessageBody, SignalType, UnitId, MAX_DATAGRAM, PROTOCOL_VERSION};
pub use session::{ProtocolSession, SessionState};
