//! Parsed telemetry broadcast to subscribers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::snapshot::KartSnapshot;

/// Karts touched by one inbound message, after merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub circuit_id: String,
    /// Merged (accumulated) snapshot of every kart present in the message.
    pub karts: BTreeMap<String, KartSnapshot>,
    /// Column order in effect when the message was processed.
    pub column_order: Vec<String>,
    /// Epoch milliseconds.
    pub received_at: u64,
}

impl TelemetryUpdate {
    /// Fold a newer update into this one.
    ///
    /// Karts only present in `self` survive; karts present in both take the
    /// newer snapshot, which is already a superset thanks to merging.
    pub fn absorb(&mut self, newer: TelemetryUpdate) {
        self.karts.extend(newer.karts);
        if !newer.column_order.is_empty() {
            self.column_order = newer.column_order;
        }
        self.circuit_id = newer.circuit_id;
        self.received_at = newer.received_at;
    }
}
