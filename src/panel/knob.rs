//! Knob filter - hysteresis and pickup ("chasing") for ADC knob samples
//!
//! Raw samples arrive inverted (the pots are wired backwards) in
//! `0..=raw_max`. Each knob reports a normalized value in `[0, 1]` that only
//! moves when the live position leaves the hysteresis band, so ADC noise never
//! reaches the audio engine.
//!
//! ## Chasing
//!
//! After a recall (patch load, mode switch) the reported value is pinned to
//! the recalled value until the physical knob comes within
//! `chase_threshold` of it. At that point the knob picks up and tracks the
//! live position again. The pickup step is at most `chase_threshold`.

use tracing::{debug, trace};

use crate::error::{IndexKind, PanelError};

/// Upper bound on knobs per panel
pub const MAX_KNOBS: usize = 16;

/// Knob modes: 0 = default, 1 = modifier held
pub const MODES: usize = 2;

/// Raw value reported by input drivers when a conversion failed
pub const RAW_READ_FAILED: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnobTuning {
    pub hysteresis: f32,
    pub chase_threshold: f32,
}

impl Default for KnobTuning {
    fn default() -> Self {
        Self {
            hysteresis: 0.012,
            chase_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Knob {
    /// Last accepted raw sample
    raw: Option<u16>,
    /// Last live normalized position
    live: Option<f32>,
    /// Reported value (pinned to the recall value while chasing)
    filtered: f32,
    mode: usize,
    saved: [Option<f32>; MODES],
    chasing: bool,
}

/// Per-panel knob state, indexed by knob id
#[derive(Debug, Clone)]
pub struct KnobBank {
    knobs: Vec<Knob>,
    raw_max: u16,
    tuning: KnobTuning,
}

impl KnobBank {
    pub fn new(count: usize, raw_max: u16, tuning: KnobTuning) -> Self {
        Self {
            knobs: vec![Knob::default(); count.min(MAX_KNOBS)],
            raw_max: raw_max.max(1),
            tuning,
        }
    }

    pub fn len(&self) -> usize {
        self.knobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knobs.is_empty()
    }

    pub fn set_tuning(&mut self, tuning: KnobTuning) {
        self.tuning = tuning;
    }

    pub fn tuning(&self) -> KnobTuning {
        self.tuning
    }

    /// Invert and normalize a raw sample to `[0, 1]`
    pub fn normalize(&self, raw: u16) -> f32 {
        let clamped = raw.min(self.raw_max);
        f32::from(self.raw_max - clamped) / f32::from(self.raw_max)
    }

    fn knob(&self, id: usize) -> Result<&Knob, PanelError> {
        let len = self.knobs.len();
        self.knobs
            .get(id)
            .ok_or_else(|| PanelError::invalid(IndexKind::Knob, id, len))
    }

    fn knob_mut(&mut self, id: usize) -> Result<&mut Knob, PanelError> {
        let len = self.knobs.len();
        self.knobs
            .get_mut(id)
            .ok_or_else(|| PanelError::invalid(IndexKind::Knob, id, len))
    }

    /// Feed one raw sample and return the reported value
    ///
    /// A sample above `raw_max` (including [`RAW_READ_FAILED`]) is treated as
    /// a failed read: the last good value is kept.
    pub fn sample(&mut self, id: usize, raw: u16) -> Result<f32, PanelError> {
        let raw_max = self.raw_max;
        let tuning = self.tuning;
        let live = self.normalize(raw);
        let knob = self.knob_mut(id)?;

        if raw > raw_max {
            trace!("Knob {} read failed (raw {}), holding {:.3}", id, raw, knob.filtered);
            return Ok(knob.filtered);
        }

        let first = knob.live.is_none();
        knob.raw = Some(raw);
        knob.live = Some(live);

        if knob.chasing {
            if (live - knob.filtered).abs() <= tuning.chase_threshold {
                debug!(
                    "Knob {} picked up at {:.3} (recalled {:.3})",
                    id, live, knob.filtered
                );
                knob.chasing = false;
                knob.filtered = live;
            }
            return Ok(knob.filtered);
        }

        if first || (live - knob.filtered).abs() > tuning.hysteresis {
            knob.filtered = live;
        }

        Ok(knob.filtered)
    }

    /// Report a failed read; returns the retained value
    pub fn sample_failed(&self, id: usize) -> Result<f32, PanelError> {
        self.knob(id).map(|k| k.filtered)
    }

    /// Store a recall value for `mode`, optionally pinning the output to it
    ///
    /// Chasing only starts when `mode` is the knob's active mode; otherwise
    /// the value waits in its slot until [`KnobBank::set_mode`] selects it.
    pub fn set_saved_value(
        &mut self,
        id: usize,
        value: f32,
        mode: usize,
        enable_chase: bool,
    ) -> Result<(), PanelError> {
        if mode >= MODES {
            return Err(PanelError::invalid(IndexKind::Mode, mode, MODES));
        }
        let knob = self.knob_mut(id)?;
        let value = value.clamp(0.0, 1.0);
        knob.saved[mode] = Some(value);

        if enable_chase && knob.mode == mode {
            knob.chasing = true;
            knob.filtered = value;
            debug!("Knob {} chasing recalled value {:.3}", id, value);
        }
        Ok(())
    }

    /// Switch the active mode, saving the outgoing value and chasing the
    /// incoming mode's saved value
    pub fn set_mode(&mut self, id: usize, mode: usize) -> Result<(), PanelError> {
        if mode >= MODES {
            return Err(PanelError::invalid(IndexKind::Mode, mode, MODES));
        }
        let knob = self.knob_mut(id)?;
        if knob.mode == mode {
            return Ok(());
        }

        let outgoing = knob.mode;
        knob.saved[outgoing] = Some(knob.filtered);
        knob.mode = mode;

        match knob.saved[mode] {
            Some(recalled) => {
                knob.chasing = true;
                knob.filtered = recalled;
            }
            None => {
                knob.chasing = false;
                if let Some(live) = knob.live {
                    knob.filtered = live;
                }
            }
        }
        trace!("Knob {} mode {} -> {}", id, outgoing, mode);
        Ok(())
    }

    pub fn value(&self, id: usize) -> Result<f32, PanelError> {
        self.knob(id).map(|k| k.filtered)
    }

    pub fn raw(&self, id: usize) -> Result<Option<u16>, PanelError> {
        self.knob(id).map(|k| k.raw)
    }

    pub fn mode(&self, id: usize) -> Result<usize, PanelError> {
        self.knob(id).map(|k| k.mode)
    }

    pub fn is_chasing(&self, id: usize) -> Result<bool, PanelError> {
        self.knob(id).map(|k| k.chasing)
    }

    /// Value each mode would recall: live output for the active mode,
    /// stored slot for the others
    pub fn recall_values(&self, id: usize) -> Result<[Option<f32>; MODES], PanelError> {
        let knob = self.knob(id)?;
        let mut values = knob.saved;
        if knob.live.is_some() || knob.chasing {
            values[knob.mode] = Some(knob.filtered);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RAW_MAX: u16 = 4095;

    fn bank() -> KnobBank {
        KnobBank::new(4, RAW_MAX, KnobTuning::default())
    }

    /// Raw sample that normalizes to `value` (pots are inverted)
    fn raw_for(value: f32) -> u16 {
        ((1.0 - value) * f32::from(RAW_MAX)).round() as u16
    }

    #[test]
    fn test_inverted_normalization() {
        let bank = bank();
        assert_eq!(bank.normalize(0), 1.0);
        assert_eq!(bank.normalize(RAW_MAX), 0.0);
        assert!((bank.normalize(raw_for(0.25)) - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_first_sample_seeds() {
        let mut bank = bank();
        let v = bank.sample(0, raw_for(0.7)).unwrap();
        assert!((v - 0.7).abs() < 0.001);
    }

    #[test]
    fn test_hysteresis_suppresses_noise() {
        let mut bank = bank();
        let seeded = bank.sample(0, 2000).unwrap();
        // 0.5% of range
        assert_eq!(bank.sample(0, 2020).unwrap(), seeded);
        assert_eq!(bank.sample(0, 1980).unwrap(), seeded);
        // 2.4% of range
        let moved = bank.sample(0, 1900).unwrap();
        assert!(moved > seeded);
    }

    #[test]
    fn test_failed_read_retains_value() {
        let mut bank = bank();
        let v = bank.sample(1, 1000).unwrap();
        assert_eq!(bank.sample(1, RAW_READ_FAILED).unwrap(), v);
        assert_eq!(bank.sample_failed(1).unwrap(), v);
        assert_eq!(bank.raw(1).unwrap(), Some(1000));
    }

    #[test]
    fn test_invalid_index_rejected() {
        let mut bank = bank();
        assert_eq!(
            bank.sample(9, 100),
            Err(PanelError::invalid(IndexKind::Knob, 9, 4))
        );
        assert!(bank.set_saved_value(0, 0.5, 2, true).is_err());
        assert!(!bank.is_chasing(0).unwrap());
    }

    #[test]
    fn test_chasing_picks_up_without_jump() {
        let mut bank = bank();
        let chase = bank.tuning().chase_threshold;
        bank.sample(0, raw_for(0.2)).unwrap();
        bank.set_saved_value(0, 0.5, 0, true).unwrap();

        let mut previous = bank.value(0).unwrap();
        assert_eq!(previous, 0.5);

        let mut picked_up = false;
        let mut position = 0.2;
        while position < 0.6 {
            let raw = raw_for(position);
            let live = bank.normalize(raw);
            let out = bank.sample(0, raw).unwrap();

            if !picked_up && (live - 0.5).abs() > chase {
                assert_eq!(out, 0.5, "pinned while {:.3} is outside the window", live);
            } else {
                picked_up = true;
                assert_eq!(out, live);
            }
            assert!((out - previous).abs() <= chase + f32::EPSILON);
            previous = out;
            position += 0.02;
        }
        assert!(picked_up);
        assert!(!bank.is_chasing(0).unwrap());
    }

    #[test]
    fn test_mode_switch_recalls_saved_value() {
        let mut bank = bank();
        bank.sample(2, raw_for(0.8)).unwrap();
        bank.set_saved_value(2, 0.1, 1, false).unwrap();
        // Saving into the inactive mode does not touch the output
        assert!((bank.value(2).unwrap() - 0.8).abs() < 0.001);

        bank.set_mode(2, 1).unwrap();
        assert_eq!(bank.value(2).unwrap(), 0.1);
        assert!(bank.is_chasing(2).unwrap());

        // Back to mode 0 recalls the value we left there
        bank.set_mode(2, 0).unwrap();
        assert!((bank.value(2).unwrap() - 0.8).abs() < 0.001);
        let recall = bank.recall_values(2).unwrap();
        assert_eq!(recall[1], Some(0.1));
    }

    proptest! {
        #[test]
        fn prop_output_moves_only_past_hysteresis(samples in prop::collection::vec(0u16..=RAW_MAX, 1..200)) {
            let mut bank = bank();
            let hysteresis = bank.tuning().hysteresis;
            let mut previous: Option<f32> = None;

            for raw in samples {
                let live = bank.normalize(raw);
                let out = bank.sample(0, raw).unwrap();
                match previous {
                    None => prop_assert_eq!(out, live),
                    Some(prev) => {
                        if (live - prev).abs() > hysteresis {
                            prop_assert_eq!(out, live);
                        } else {
                            prop_assert_eq!(out, prev);
                        }
                    }
                }
                previous = Some(out);
            }
        }

        #[test]
        fn prop_chase_never_jumps_more_than_threshold(start in 0.0f32..1.0, target in 0.0f32..1.0) {
            let mut bank = bank();
            let chase = bank.tuning().chase_threshold;
            bank.sample(0, raw_for(start)).unwrap();
            bank.set_saved_value(0, target, 0, true).unwrap();

            let mut previous = bank.value(0).unwrap();
            let step = if target >= start { 0.01 } else { -0.01 };
            let mut position = start;
            for _ in 0..120 {
                let out = bank.sample(0, raw_for(position.clamp(0.0, 1.0))).unwrap();
                if bank.is_chasing(0).unwrap() {
                    prop_assert_eq!(out, target);
                } else if previous == target {
                    prop_assert!((out - previous).abs() <= chase + 1e-6);
                }
                previous = out;
                position += step;
            }
        }
    }
}
