//! Error types shared by the panel, hardware and transport layers
//!
//! None of these are fatal to the control loop: hardware and transport
//! failures are logged and the loop keeps running on the last known state.

use std::fmt;
use thiserror::Error;

/// Which per-id table an index was checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Knob,
    Button,
    Led,
    Jack,
    Mode,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Knob => write!(f, "knob"),
            IndexKind::Button => write!(f, "button"),
            IndexKind::Led => write!(f, "led"),
            IndexKind::Jack => write!(f, "jack"),
            IndexKind::Mode => write!(f, "knob mode"),
        }
    }
}

/// Errors returned at the panel call boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    /// Index outside the configured table; nothing was mutated
    #[error("invalid {kind} index {index} (have {len})")]
    InvalidIndex {
        kind: IndexKind,
        index: usize,
        len: usize,
    },
}

impl PanelError {
    pub fn invalid(kind: IndexKind, index: usize, len: usize) -> Self {
        PanelError::InvalidIndex { kind, index, len }
    }
}

/// Failures reported by input/output drivers
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("failed to read button register: {0}")]
    ButtonRead(String),

    #[error("failed to read knob {knob}: {reason}")]
    KnobRead { knob: usize, reason: String },

    #[error("failed to write LED register: {0}")]
    LedWrite(String),
}

/// Wire encoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("datagram of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported protocol version {0}")]
    Version(u8),
}

/// Network send failures (logged by the caller, never retried)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_invalid_index_display() {
        let err = PanelError::invalid(IndexKind::Led, 40, 32);
        assert_eq!(err.to_string(), "invalid led index 40 (have 32)");
    }

    #[test]
    fn test_transport_error_keeps_codec_source() {
        let err = TransportError::from(CodecError::TooLarge { size: 2000, limit: 1024 });
        assert!(err.to_string().contains("2000"));
        assert!(err.source().is_none());
    }

    #[test]
    fn test_knob_read_display() {
        let err = HardwareError::KnobRead {
            knob: 3,
            reason: "adc busy".to_string(),
        };
        assert_eq!(err.to_string(), "failed to read knob 3: adc busy");
    }
}
