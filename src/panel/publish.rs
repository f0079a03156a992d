//! Lock-free hand-off of filtered knob values to the audio engine
//!
//! The control loop is the only writer. The audio thread reads the latest
//! value of every (knob, mode) pair without locking. Values are stored as
//! `f32` bit patterns in `AtomicU32`; a reader sees either the old or the new
//! value, never a torn one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::knob::MODES;

/// Marks a slot that has never been published
const UNSET: u32 = u32::MAX;

#[derive(Debug)]
struct Slots {
    values: Vec<[AtomicU32; MODES]>,
}

/// Writer side, owned by the control loop
#[derive(Debug)]
pub struct KnobPublisher {
    slots: Arc<Slots>,
}

/// Reader side, cheap to clone into the audio thread
#[derive(Debug, Clone)]
pub struct KnobReader {
    slots: Arc<Slots>,
}

/// Create a publisher/reader pair for `knobs` knobs
pub fn knob_channel(knobs: usize) -> (KnobPublisher, KnobReader) {
    let values = (0..knobs)
        .map(|_| std::array::from_fn(|_| AtomicU32::new(UNSET)))
        .collect();
    let slots = Arc::new(Slots { values });
    (
        KnobPublisher {
            slots: Arc::clone(&slots),
        },
        KnobReader { slots },
    )
}

impl KnobPublisher {
    /// Publish; out-of-range ids are ignored
    pub fn publish(&self, knob: usize, mode: usize, value: f32) {
        if let Some(slot) = self.slots.values.get(knob).and_then(|m| m.get(mode)) {
            slot.store(value.to_bits(), Ordering::Release);
        }
    }

    pub fn reader(&self) -> KnobReader {
        KnobReader {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl KnobReader {
    /// Latest published value, None if never published or out of range
    pub fn get(&self, knob: usize, mode: usize) -> Option<f32> {
        let bits = self
            .slots
            .values
            .get(knob)
            .and_then(|m| m.get(mode))?
            .load(Ordering::Acquire);
        (bits != UNSET).then(|| f32::from_bits(bits))
    }

    pub fn len(&self) -> usize {
        self.slots.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unpublished_is_none() {
        let (_publisher, reader) = knob_channel(2);
        assert_eq!(reader.get(0, 0), None);
        assert_eq!(reader.get(5, 0), None);
    }

    #[test]
    fn test_reader_sees_values_across_threads() {
        let (publisher, reader) = knob_channel(4);

        let writer = thread::spawn(move || {
            for i in 0..=1000u32 {
                publisher.publish(3, 1, i as f32 / 1000.0);
            }
        });

        let mut last = -1.0f32;
        while last < 1.0 {
            if let Some(v) = reader.get(3, 1) {
                assert!((0.0..=1.0).contains(&v));
                assert!(v >= last, "values are published in increasing order");
                last = v;
            }
            if writer.is_finished() && reader.get(3, 1) == Some(1.0) {
                break;
            }
        }
        writer.join().unwrap();
        assert_eq!(reader.get(3, 1), Some(1.0));
        assert_eq!(reader.get(3, 0), None);
    }
}
