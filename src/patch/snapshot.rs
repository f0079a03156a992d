//! Versioned patch snapshot
//!
//! What a unit persists between restarts: its connections plus the saved
//! value of every knob in every mode. Snapshots are stored as JSON in the
//! sled database.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::registry::{PatchConnection, PatchRegistry};
use crate::panel::knob::{KnobBank, MODES};
use crate::protocol::UnitId;

/// Saved value of one knob in one mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnobRecord {
    pub knob: usize,
    pub mode: usize,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatchSnapshot {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub unit: UnitId,
    #[serde(default)]
    pub connections: Vec<PatchConnection>,
    #[serde(default)]
    pub controls: Vec<KnobRecord>,
}

impl PatchSnapshot {
    /// Current snapshot format version
    pub const VERSION: &'static str = "1.0.0";

    /// Capture the registry and every knob's recall values
    pub fn capture(unit: UnitId, registry: &PatchRegistry, knobs: &KnobBank) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            saved_at: Utc::now(),
            unit,
            connections: registry.serialize(),
            controls: knob_records(knobs),
        }
    }

    pub fn empty(unit: UnitId) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            saved_at: Utc::now(),
            unit,
            connections: Vec::new(),
            controls: Vec::new(),
        }
    }
}

/// Every (knob, mode) pair that has a value to recall
pub fn knob_records(knobs: &KnobBank) -> Vec<KnobRecord> {
    let mut records = Vec::new();
    for knob in 0..knobs.len() {
        let Ok(values) = knobs.recall_values(knob) else {
            continue;
        };
        for (mode, value) in values.iter().enumerate().take(MODES) {
            if let Some(value) = value {
                records.push(KnobRecord {
                    knob,
                    mode,
                    value: *value,
                });
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::knob::KnobTuning;
    use crate::protocol::JackAddr;

    fn registry() -> PatchRegistry {
        let mut registry = PatchRegistry::new();
        registry.connect(JackAddr { unit: 1, jack: 0 }, JackAddr { unit: 2, jack: 1 }, 0.5);
        registry
    }

    #[test]
    fn test_capture_collects_knob_modes() {
        let mut knobs = KnobBank::new(3, 4095, KnobTuning::default());
        knobs.sample(0, 0).unwrap();
        knobs.set_saved_value(1, 0.3, 1, false).unwrap();

        let snapshot = PatchSnapshot::capture(2, &registry(), &knobs);
        assert_eq!(snapshot.version, PatchSnapshot::VERSION);
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(
            snapshot.controls,
            vec![
                KnobRecord { knob: 0, mode: 0, value: 1.0 },
                KnobRecord { knob: 1, mode: 1, value: 0.3 },
            ]
        );
    }
}
