//! Panel state: knob filter, button classifier and LED scheduler
//!
//! Everything in here is synchronous and owned by the control loop. The only
//! state shared with other threads is the published knob values (see
//! [`publish`]).

pub mod buttons;
pub mod knob;
pub mod leds;
pub mod publish;

use crate::config::{AppConfig, TuningConfig};

use buttons::ButtonClassifier;
use knob::{KnobBank, KnobTuning};
use leds::LedScheduler;

pub use buttons::{ButtonEvent, PressKind, BUTTON_COUNT};
pub use knob::{MAX_KNOBS, MODES};
pub use leds::{LedBinding, LedColor, LedState, LED_COUNT};
pub use publish::{knob_channel, KnobPublisher, KnobReader};

impl From<&TuningConfig> for KnobTuning {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            hysteresis: tuning.hysteresis,
            chase_threshold: tuning.chase_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Panel {
    pub knobs: KnobBank,
    pub buttons: ButtonClassifier,
    pub leds: LedScheduler,
}

impl Panel {
    pub fn new(config: &AppConfig) -> Self {
        let tuning = &config.tuning;
        Self {
            knobs: KnobBank::new(config.panel.knobs, config.panel.raw_max, tuning.into()),
            buttons: ButtonClassifier::new(tuning.long_press_ms),
            leds: LedScheduler::new(tuning.fast_ticks(), tuning.slow_ticks()),
        }
    }

    /// Re-apply tunables after a config reload; panel state is kept
    pub fn apply_tuning(&mut self, tuning: &TuningConfig) {
        self.knobs.set_tuning(tuning.into());
        self.buttons.set_long_press_ms(tuning.long_press_ms);
        self.leds.set_intervals(tuning.fast_ticks(), tuning.slow_ticks());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_tuning_keeps_state() {
        let config = AppConfig::from_yaml("unit: { id: 1 }\npanel: { knobs: 2 }\n").unwrap();
        let mut panel = Panel::new(&config);
        let before = panel.knobs.sample(0, 1000).unwrap();

        let tuning = TuningConfig {
            long_press_ms: 600,
            hysteresis: 0.2,
            ..TuningConfig::default()
        };
        panel.apply_tuning(&tuning);

        assert_eq!(panel.buttons.long_press_ms(), 600);
        assert_eq!(panel.knobs.tuning().hysteresis, 0.2);
        assert_eq!(panel.knobs.value(0).unwrap(), before);
        assert_eq!(panel.knobs.len(), 2);
    }
}
