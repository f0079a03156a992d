//! Wire messages of the patching protocol
//!
//! Every datagram is one JSON-encoded [`Envelope`]. Messages are unordered,
//! unacknowledged and may be lost or duplicated; receivers must handle every
//! body idempotently.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::JackDirection;
use crate::error::CodecError;
use crate::patch::{KnobRecord, PatchConnection};

/// Network-wide unit identifier
pub type UnitId = u16;

/// Current envelope format
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram we send or accept
pub const MAX_DATAGRAM: usize = 1024;

/// A jack anywhere on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct JackAddr {
    pub unit: UnitId,
    pub jack: u8,
}

impl JackAddr {
    pub fn new(unit: UnitId, jack: u8) -> Self {
        Self { unit, jack }
    }
}

impl fmt::Display for JackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{}:J{}", self.unit, self.jack)
    }
}

/// What a jack carries; a request is only offered to inputs of the same type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Cv,
    Audio,
    Gate,
}

/// One jack as advertised in a capabilities reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JackCapability {
    pub id: u8,
    pub direction: JackDirection,
    pub signal: SignalType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// An output wants a destination
    Request { source: JackAddr, signal: SignalType },
    /// An offered input was chosen
    Complete {
        source: JackAddr,
        dest: JackAddr,
        scale: f32,
    },
    /// Stop offering inputs for `source`
    Clear { source: JackAddr },
    /// Negotiation for `source` was abandoned
    Cancel { source: JackAddr },
    /// Forget the connection into `dest`
    Disconnect { dest: JackAddr },
    /// Flash the output LED of `source`
    Identify { source: JackAddr },
    /// Ask every unit to report its connections
    StateInquiry,
    /// The sender's connections into its own jacks
    StateReport {
        connections: Vec<PatchConnection>,
        #[serde(default)]
        controls: Vec<KnobRecord>,
    },
    /// Bulk reload; `target` None addresses every unit
    Restore {
        #[serde(default)]
        target: Option<UnitId>,
        connections: Vec<PatchConnection>,
        #[serde(default)]
        controls: Vec<KnobRecord>,
    },
    /// Ask every unit to describe itself
    CapabilitiesInquiry,
    /// The sender's name and jacks
    Capabilities { name: String, jacks: Vec<JackCapability> },
}

impl MessageBody {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Request { .. } => "request",
            MessageBody::Complete { .. } => "complete",
            MessageBody::Clear { .. } => "clear",
            MessageBody::Cancel { .. } => "cancel",
            MessageBody::Disconnect { .. } => "disconnect",
            MessageBody::Identify { .. } => "identify",
            MessageBody::StateInquiry => "state_inquiry",
            MessageBody::StateReport { .. } => "state_report",
            MessageBody::Restore { .. } => "restore",
            MessageBody::CapabilitiesInquiry => "caps_inquiry",
            MessageBody::Capabilities { .. } => "capabilities",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    /// Sending unit
    pub unit: UnitId,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(unit: UnitId, body: MessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            unit,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(self).map_err(CodecError::Encode)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                limit: MAX_DATAGRAM,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                limit: MAX_DATAGRAM,
            });
        }
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(CodecError::Version(envelope.version));
        }
        Ok(envelope)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{} {}", self.unit, self.body.kind())?;
        match &self.body {
            MessageBody::Request { source, signal } => write!(f, " {} ({:?})", source, signal),
            MessageBody::Complete { source, dest, scale } => {
                write!(f, " {} -> {} x{}", source, dest, scale)
            }
            MessageBody::Clear { source }
            | MessageBody::Cancel { source }
            | MessageBody::Identify { source } => write!(f, " {}", source),
            MessageBody::Disconnect { dest } => write!(f, " {}", dest),
            MessageBody::StateInquiry | MessageBody::CapabilitiesInquiry => Ok(()),
            MessageBody::StateReport { connections, .. } => {
                write!(f, " ({} connections)", connections.len())
            }
            MessageBody::Restore { target, connections, .. } => match target {
                Some(unit) => write!(f, " U{} ({} connections)", unit, connections.len()),
                None => write!(f, " all ({} connections)", connections.len()),
            },
            MessageBody::Capabilities { name, jacks } => write!(f, " '{}' ({} jacks)", name, jacks.len()),
        }
    }
}
