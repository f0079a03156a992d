//! LED scheduler
//!
//! Every LED carries a state (off, on, fast blink, slow blink) and a per-LED
//! countdown. One `tick()` per control tick decrements the countdowns of the
//! blinking LEDs, toggles the ones that reach zero and reloads them. The
//! physical register is only written when the resulting 32-bit mask changed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{IndexKind, PanelError};

/// LEDs on one shift-register chain
pub const LED_COUNT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedState {
    #[default]
    Off,
    On,
    BlinkFast,
    BlinkSlow,
}

impl LedState {
    pub fn is_blinking(self) -> bool {
        matches!(self, LedState::BlinkFast | LedState::BlinkSlow)
    }
}

/// Which half of a jack's LED binding to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Off,
    Primary,
    Secondary,
    Both,
}

/// How a jack's indicator maps onto physical LEDs
///
/// A plain index is a single-colour LED. A dual binding drives a bi-colour
/// LED through two register bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum LedBinding {
    Single(usize),
    Dual { primary: usize, secondary: usize },
}

impl LedBinding {
    pub fn indices(&self) -> Vec<usize> {
        match *self {
            LedBinding::Single(index) => vec![index],
            LedBinding::Dual { primary, secondary } => vec![primary, secondary],
        }
    }

    /// Drive this binding in `color` with `state`; unused halves go dark
    pub fn apply(
        &self,
        leds: &mut LedScheduler,
        color: LedColor,
        state: LedState,
    ) -> Result<(), PanelError> {
        match *self {
            LedBinding::Single(index) => {
                let state = if color == LedColor::Off { LedState::Off } else { state };
                leds.set_state(index, state)
            }
            LedBinding::Dual { primary, secondary } => {
                let (p, s) = match color {
                    LedColor::Off => (LedState::Off, LedState::Off),
                    LedColor::Primary => (state, LedState::Off),
                    LedColor::Secondary => (LedState::Off, state),
                    LedColor::Both => (state, state),
                };
                // Both halves must exist before either changes
                leds.state(primary)?;
                leds.state(secondary)?;
                leds.set_state(primary, p)?;
                leds.set_state(secondary, s)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Led {
    state: LedState,
    lit: bool,
    countdown: u32,
}

#[derive(Debug, Clone)]
pub struct LedScheduler {
    leds: [Led; LED_COUNT],
    fast_ticks: u32,
    slow_ticks: u32,
    /// Mask most recently handed out for writing
    written: Option<u32>,
}

impl LedScheduler {
    pub fn new(fast_ticks: u32, slow_ticks: u32) -> Self {
        Self {
            leds: [Led::default(); LED_COUNT],
            fast_ticks: fast_ticks.max(1),
            slow_ticks: slow_ticks.max(1),
            written: None,
        }
    }

    /// Change blink rates; running countdowns keep going and reload at the new rate
    pub fn set_intervals(&mut self, fast_ticks: u32, slow_ticks: u32) {
        self.fast_ticks = fast_ticks.max(1);
        self.slow_ticks = slow_ticks.max(1);
    }

    fn interval(&self, state: LedState) -> u32 {
        match state {
            LedState::BlinkFast => self.fast_ticks,
            LedState::BlinkSlow => self.slow_ticks,
            LedState::Off | LedState::On => 0,
        }
    }

    /// Set a LED's state and restart its countdown; a blink starts lit
    pub fn set_state(&mut self, id: usize, state: LedState) -> Result<(), PanelError> {
        let interval = self.interval(state);
        let led = self
            .leds
            .get_mut(id)
            .ok_or_else(|| PanelError::invalid(IndexKind::Led, id, LED_COUNT))?;

        led.state = state;
        led.lit = state != LedState::Off;
        led.countdown = interval;
        Ok(())
    }

    pub fn blink(&mut self, id: usize, fast: bool) -> Result<(), PanelError> {
        let state = if fast { LedState::BlinkFast } else { LedState::BlinkSlow };
        self.set_state(id, state)
    }

    pub fn state(&self, id: usize) -> Result<LedState, PanelError> {
        self.leds
            .get(id)
            .map(|led| led.state)
            .ok_or_else(|| PanelError::invalid(IndexKind::Led, id, LED_COUNT))
    }

    pub fn is_lit(&self, id: usize) -> Result<bool, PanelError> {
        self.leds
            .get(id)
            .map(|led| led.lit)
            .ok_or_else(|| PanelError::invalid(IndexKind::Led, id, LED_COUNT))
    }

    /// Current on/off levels as a register mask (bit n = LED n)
    pub fn mask(&self) -> u32 {
        self.leds
            .iter()
            .enumerate()
            .filter(|(_, led)| led.lit)
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }

    /// Advance one tick; returns the mask to write, or None if unchanged
    pub fn tick(&mut self) -> Option<u32> {
        let (fast, slow) = (self.fast_ticks, self.slow_ticks);

        for led in self.leds.iter_mut() {
            let interval = match led.state {
                LedState::BlinkFast => fast,
                LedState::BlinkSlow => slow,
                LedState::Off | LedState::On => continue,
            };
            led.countdown = led.countdown.saturating_sub(1);
            if led.countdown == 0 {
                led.lit = !led.lit;
                led.countdown = interval;
            }
        }

        let mask = self.mask();
        if self.written == Some(mask) {
            return None;
        }
        self.written = Some(mask);
        Some(mask)
    }

    /// Forget the last written mask so the next tick writes unconditionally
    pub fn force_refresh(&mut self) {
        self.written = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ticks (1-based) at which `id` changes level over `ticks` ticks
    fn toggle_ticks(leds: &mut LedScheduler, id: usize, ticks: u32) -> Vec<u32> {
        let mut toggles = Vec::new();
        let mut lit = leds.is_lit(id).unwrap();
        for t in 1..=ticks {
            leds.tick();
            let now = leds.is_lit(id).unwrap();
            if now != lit {
                toggles.push(t);
                lit = now;
            }
        }
        toggles
    }

    #[test]
    fn test_fast_blink_toggles_every_interval() {
        let mut leds = LedScheduler::new(12, 24);
        leds.blink(4, true).unwrap();
        assert!(leds.is_lit(4).unwrap());
        assert_eq!(toggle_ticks(&mut leds, 4, 60), vec![12, 24, 36, 48, 60]);
    }

    #[test]
    fn test_slow_blink_is_half_frequency() {
        let mut leds = LedScheduler::new(12, 24);
        leds.blink(0, true).unwrap();
        leds.blink(1, false).unwrap();

        let mut fast = 0;
        let mut slow = 0;
        let mut last = leds.mask();
        for _ in 0..240 {
            leds.tick();
            let mask = leds.mask();
            fast += ((mask ^ last) & 0b01 != 0) as u32;
            slow += ((mask ^ last) & 0b10 != 0) as u32;
            last = mask;
        }
        assert_eq!(fast, 20);
        assert_eq!(slow, 10);
    }

    #[test]
    fn test_tick_reports_only_changes() {
        let mut leds = LedScheduler::new(3, 6);
        leds.set_state(7, LedState::On).unwrap();

        assert_eq!(leds.tick(), Some(1 << 7));
        assert_eq!(leds.tick(), None);

        leds.blink(2, true).unwrap();
        assert_eq!(leds.tick(), Some((1 << 7) | (1 << 2)));
        assert_eq!(leds.tick(), None);
        // Third tick since the blink began turns LED 2 off
        assert_eq!(leds.tick(), Some(1 << 7));

        leds.force_refresh();
        assert_eq!(leds.tick(), Some(1 << 7));
    }

    #[test]
    fn test_reasserting_state_restarts_blink() {
        let mut leds = LedScheduler::new(4, 8);
        leds.blink(3, true).unwrap();
        leds.tick();
        leds.tick();
        leds.tick();
        leds.blink(3, true).unwrap();
        assert!(leds.is_lit(3).unwrap());

        // A full interval from the restart, not from the first blink
        leds.tick();
        leds.tick();
        leds.tick();
        assert!(leds.is_lit(3).unwrap());
        leds.tick();
        assert!(!leds.is_lit(3).unwrap());
    }

    #[test]
    fn test_dual_binding_colors() {
        let mut leds = LedScheduler::new(4, 8);
        let binding = LedBinding::Dual { primary: 5, secondary: 6 };

        binding.apply(&mut leds, LedColor::Secondary, LedState::BlinkSlow).unwrap();
        assert_eq!(leds.state(5).unwrap(), LedState::Off);
        assert_eq!(leds.state(6).unwrap(), LedState::BlinkSlow);

        binding.apply(&mut leds, LedColor::Primary, LedState::On).unwrap();
        assert_eq!(leds.mask(), 1 << 5);
        assert_eq!(binding.indices(), vec![5, 6]);
    }

    #[test]
    fn test_binding_yaml_forms() {
        let single: LedBinding = serde_yaml::from_str("3").unwrap();
        assert_eq!(single, LedBinding::Single(3));
        let dual: LedBinding = serde_yaml::from_str("{ primary: 1, secondary: 2 }").unwrap();
        assert_eq!(dual, LedBinding::Dual { primary: 1, secondary: 2 });
    }

    #[test]
    fn test_invalid_led_leaves_state_untouched() {
        let mut leds = LedScheduler::new(4, 8);
        let before = leds.mask();
        assert_eq!(
            leds.set_state(32, LedState::On),
            Err(PanelError::invalid(IndexKind::Led, 32, LED_COUNT))
        );
        assert_eq!(leds.mask(), before);
    }

    #[test]
    fn test_dual_binding_with_bad_half_changes_nothing() {
        let mut leds = LedScheduler::new(4, 8);
        let binding = LedBinding::Dual { primary: 5, secondary: 40 };

        assert_eq!(
            binding.apply(&mut leds, LedColor::Primary, LedState::On),
            Err(PanelError::invalid(IndexKind::Led, 40, LED_COUNT))
        );
        assert_eq!(leds.state(5).unwrap(), LedState::Off);
        assert_eq!(leds.mask(), 0);
    }
}
