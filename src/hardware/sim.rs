//! In-memory panel used by the simulator REPL and the scenario tests

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{PanelInput, PanelOutput};
use crate::error::HardwareError;
use crate::panel::MAX_KNOBS;

#[derive(Debug, Default)]
struct SimState {
    buttons: u16,
    knobs: [u16; MAX_KNOBS],
    leds: u32,
    led_writes: usize,
    fail_buttons: bool,
    fail_knobs: bool,
    fail_leds: bool,
}

/// Simulated panel; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct SimPanel {
    state: Arc<Mutex<SimState>>,
}

impl SimPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self, button: usize) {
        if button < 16 {
            self.state.lock().buttons |= 1 << button;
        }
    }

    pub fn release(&self, button: usize) {
        if button < 16 {
            self.state.lock().buttons &= !(1 << button);
        }
    }

    pub fn set_buttons(&self, mask: u16) {
        self.state.lock().buttons = mask;
    }

    pub fn set_knob(&self, knob: usize, raw: u16) {
        if let Some(slot) = self.state.lock().knobs.get_mut(knob) {
            *slot = raw;
        }
    }

    /// Last mask written to the LED register
    pub fn leds(&self) -> u32 {
        self.state.lock().leds
    }

    pub fn is_lit(&self, led: usize) -> bool {
        led < 32 && self.leds() & (1 << led) != 0
    }

    /// Number of register writes so far
    pub fn led_writes(&self) -> usize {
        self.state.lock().led_writes
    }

    /// Make subsequent button reads fail
    pub fn fail_buttons(&self, fail: bool) {
        self.state.lock().fail_buttons = fail;
    }

    pub fn fail_knobs(&self, fail: bool) {
        self.state.lock().fail_knobs = fail;
    }

    pub fn fail_leds(&self, fail: bool) {
        self.state.lock().fail_leds = fail;
    }
}

impl PanelInput for SimPanel {
    fn name(&self) -> &str {
        "sim"
    }

    fn read_buttons(&self) -> Result<u16, HardwareError> {
        let state = self.state.lock();
        if state.fail_buttons {
            return Err(HardwareError::ButtonRead("simulated failure".to_string()));
        }
        Ok(state.buttons)
    }

    fn read_knob(&self, knob: usize) -> Result<u16, HardwareError> {
        let state = self.state.lock();
        if state.fail_knobs {
            return Err(HardwareError::KnobRead {
                knob,
                reason: "simulated failure".to_string(),
            });
        }
        state.knobs.get(knob).copied().ok_or_else(|| HardwareError::KnobRead {
            knob,
            reason: "no such knob".to_string(),
        })
    }
}

impl PanelOutput for SimPanel {
    fn write_leds(&self, mask: u32) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.fail_leds {
            return Err(HardwareError::LedWrite("simulated failure".to_string()));
        }
        trace!("LED register <- {:032b}", mask);
        state.leds = mask;
        state.led_writes += 1;
        Ok(())
    }
}
