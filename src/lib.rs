//! Patch Surface - control-surface engine for networked modular synth units
//!
//! Turns raw button bitmasks and knob samples into classified input, drives
//! the LED feedback of the panel and runs the virtual patching protocol that
//! connects an output jack on one unit to an input jack on another by
//! pressing buttons instead of plugging cables.

pub mod config;
pub mod control_loop;
pub mod error;
pub mod hardware;
pub mod panel;
pub mod patch;
pub mod paths;
pub mod protocol;
pub mod transport;

pub use config::AppConfig;
pub use control_loop::ControlLoop;
pub use error::{CodecError, HardwareError, IndexKind, PanelError, TransportError};
pub use protocol::{Envelope, JackAddr, MessageBody, UnitId};
