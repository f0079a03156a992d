//! Jack indicators -> LED states

use tracing::{debug, warn};

use crate::panel::{LedColor, LedState};
use crate::protocol::JackIndicator;

/// Colour and pattern shown for an indicator
pub fn led_for(indicator: JackIndicator) -> (LedColor, LedState) {
    match indicator {
        JackIndicator::Idle => (LedColor::Off, LedState::Off),
        JackIndicator::Requesting => (LedColor::Secondary, LedState::BlinkSlow),
        JackIndicator::Offering => (LedColor::Secondary, LedState::BlinkFast),
        JackIndicator::Connected => (LedColor::Primary, LedState::On),
        JackIndicator::Identifying => (LedColor::Primary, LedState::BlinkFast),
    }
}

impl super::ControlLoop {
    /// Redraw the LEDs of every jack whose indicator changed since the last tick
    pub(super) fn refresh_indicators(&mut self) {
        for (&jack, binding) in &self.jack_leds {
            let indicator = match self.protocol.jack_indicator(jack) {
                Ok(indicator) => indicator,
                Err(e) => {
                    warn!("No indicator for jack {}: {}", jack, e);
                    continue;
                }
            };
            if self.indicators.get(&jack) == Some(&indicator) {
                continue;
            }

            let (color, state) = led_for(indicator);
            match binding.apply(&mut self.panel.leds, color, state) {
                Ok(()) => {
                    debug!("Jack {} -> {:?}", jack, indicator);
                    self.indicators.insert(jack, indicator);
                }
                Err(e) => warn!("Jack {} LED binding rejected: {}", jack, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_and_request_are_distinguishable() {
        let (_, request) = led_for(JackIndicator::Requesting);
        let (_, offer) = led_for(JackIndicator::Offering);
        assert!(request.is_blinking());
        assert!(offer.is_blinking());
        assert_ne!(request, offer);
    }

    #[test]
    fn test_idle_is_dark() {
        assert_eq!(led_for(JackIndicator::Idle), (LedColor::Off, LedState::Off));
    }
}
