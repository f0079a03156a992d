//! Patch registry - the set of active virtual connections
//!
//! Keyed by destination: an input jack listens to at most one source, while
//! an output may feed any number of inputs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::protocol::{JackAddr, UnitId};

/// One source -> destination connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatchConnection {
    pub source: JackAddr,
    pub dest: JackAddr,
    pub scale: f32,
}

#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    connections: BTreeMap<JackAddr, PatchConnection>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `source` to `dest`, returning the connection it replaced
    pub fn connect(&mut self, source: JackAddr, dest: JackAddr, scale: f32) -> Option<PatchConnection> {
        let replaced = self
            .connections
            .insert(dest, PatchConnection { source, dest, scale });
        if let Some(old) = &replaced {
            if old.source != source {
                debug!("Connection to {} moved from {} to {}", dest, old.source, source);
            }
        }
        replaced
    }

    pub fn disconnect(&mut self, dest: JackAddr) -> bool {
        self.connections.remove(&dest).is_some()
    }

    pub fn lookup(&self, dest: JackAddr) -> Option<&PatchConnection> {
        self.connections.get(&dest)
    }

    /// All connections ordered by destination
    pub fn serialize(&self) -> Vec<PatchConnection> {
        self.connections.values().copied().collect()
    }

    /// Replace the whole registry; for duplicate destinations the last record wins
    pub fn deserialize(&mut self, records: impl IntoIterator<Item = PatchConnection>) {
        self.connections = records.into_iter().map(|c| (c.dest, c)).collect();
    }

    pub fn connections_from(&self, source: JackAddr) -> Vec<PatchConnection> {
        self.connections
            .values()
            .filter(|c| c.source == source)
            .copied()
            .collect()
    }

    /// Connections whose destination lives on `unit`
    pub fn connections_into(&self, unit: UnitId) -> Vec<PatchConnection> {
        self.connections
            .values()
            .filter(|c| c.dest.unit == unit)
            .copied()
            .collect()
    }

    /// Drop every connection into `unit`; returns how many were removed
    pub fn clear_unit(&mut self, unit: UnitId) -> usize {
        let before = self.connections.len();
        self.connections.retain(|dest, _| dest.unit != unit);
        before - self.connections.len()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
