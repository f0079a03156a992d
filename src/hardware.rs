//! Hardware seams between the control loop and the panel electronics
//!
//! The loop polls buttons and knobs through [`PanelInput`] and writes the LED
//! register through [`PanelOutput`]. Real boards implement these on top of
//! their shift registers and ADC; [`sim::SimPanel`] implements both in memory
//! for tests and the interactive simulator.
//!
//! Note: methods take `&self` so one driver can be shared between the loop
//! and a REPL; implementations use interior mutability.

pub mod sim;

use crate::error::HardwareError;

pub use sim::SimPanel;

/// Button register and knob ADC
pub trait PanelInput: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &str;

    /// Read the 16-bit button register (bit n = button n, 1 = pressed)
    fn read_buttons(&self) -> Result<u16, HardwareError>;

    /// Read one raw knob sample in `0..=raw_max`
    fn read_knob(&self, knob: usize) -> Result<u16, HardwareError>;
}

/// LED register
pub trait PanelOutput: Send + Sync {
    /// Write the 32-bit LED mask (bit n = LED n, 1 = lit)
    fn write_leds(&self, mask: u32) -> Result<(), HardwareError>;
}
