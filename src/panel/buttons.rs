//! Button classifier - turns the polled shift-register bitmask into
//! SHORT/LONG press events
//!
//! Each button is classified on its own from the same 16-bit mask. The press
//! kind is decided only at the release edge from the held duration, so the
//! classification error is bounded by one control tick.

use serde::{Deserialize, Serialize};

use crate::error::{IndexKind, PanelError};

/// Buttons on one shift-register chain
pub const BUTTON_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressKind {
    Short,
    Long,
}

/// One classified release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: usize,
    pub kind: PressKind,
    pub held_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ButtonState {
    pressed: bool,
    pressed_at: u64,
    /// Kind resolved at the most recent release
    last_kind: Option<PressKind>,
}

#[derive(Debug, Clone)]
pub struct ButtonClassifier {
    buttons: [ButtonState; BUTTON_COUNT],
    long_press_ms: u64,
}

impl ButtonClassifier {
    pub fn new(long_press_ms: u64) -> Self {
        Self {
            buttons: [ButtonState::default(); BUTTON_COUNT],
            long_press_ms,
        }
    }

    pub fn set_long_press_ms(&mut self, long_press_ms: u64) {
        self.long_press_ms = long_press_ms;
    }

    pub fn long_press_ms(&self) -> u64 {
        self.long_press_ms
    }

    /// Resolve a held duration; the threshold itself counts as LONG
    pub fn classify(&self, held_ms: u64) -> PressKind {
        if held_ms < self.long_press_ms {
            PressKind::Short
        } else {
            PressKind::Long
        }
    }

    /// Advance all buttons to `now_ms` with the freshly polled `mask`
    pub fn advance(&mut self, now_ms: u64, mask: u16) -> Vec<ButtonEvent> {
        let mut events = Vec::new();

        for index in 0..BUTTON_COUNT {
            let level = mask & (1 << index) != 0;
            let was_pressed = self.buttons[index].pressed;

            if level && !was_pressed {
                let state = &mut self.buttons[index];
                state.pressed = true;
                state.pressed_at = now_ms;
            } else if !level && was_pressed {
                let held_ms = now_ms.saturating_sub(self.buttons[index].pressed_at);
                let kind = self.classify(held_ms);
                let state = &mut self.buttons[index];
                state.pressed = false;
                state.last_kind = Some(kind);
                events.push(ButtonEvent {
                    button: index,
                    kind,
                    held_ms,
                });
            }
        }

        events
    }

    pub fn is_held(&self, button: usize) -> Result<bool, PanelError> {
        self.buttons
            .get(button)
            .map(|b| b.pressed)
            .ok_or_else(|| PanelError::invalid(IndexKind::Button, button, BUTTON_COUNT))
    }

    /// Kind of the last completed press; None while held or never released
    pub fn last_press(&self, button: usize) -> Result<Option<PressKind>, PanelError> {
        self.buttons
            .get(button)
            .map(|b| if b.pressed { None } else { b.last_kind })
            .ok_or_else(|| PanelError::invalid(IndexKind::Button, button, BUTTON_COUNT))
    }
}
