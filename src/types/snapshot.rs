//! Per-kart telemetry snapshots and field merging

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::lap_time::{is_no_time_marker, is_placeholder};

/// Field-name spellings of the "last lap time" column, in priority order.
pub const LAST_LAP_FIELDS: &[&str] =
    &["last_lap_time", "last_lap", "lastLapTime", "lastLap", "LastLap", "Last Lap"];

/// One kart's timing fields as reported at a point in time.
///
/// Values are kept as trimmed strings; the feed mixes numbers and strings for
/// the same column between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KartSnapshot {
    fields: BTreeMap<String, String>,
}

impl KartSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from the JSON object the feed sends for one kart.
    ///
    /// Nulls are dropped. Nested values are kept as their JSON text.
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let fields = object
            .iter()
            .filter_map(|(name, value)| {
                let rendered = match value {
                    Value::Null => return None,
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => other.to_string(),
                };
                Some((name.clone(), rendered))
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Insert a field verbatim, bypassing merge rules.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into().trim().to_string());
    }

    /// First present field among `names`, in order.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }

    /// The "last lap time" column under whichever spelling the feed uses.
    pub fn last_lap_time(&self) -> Option<&str> {
        self.first_of(LAST_LAP_FIELDS)
    }

    /// Merge a partial update into this snapshot.
    ///
    /// A blank incoming value is ignored. A no-time marker is only stored when
    /// the field has no value yet, so a real reading is never erased by a
    /// partial tick. Last-lap columns treat any placeholder (`—`, `-:--.---`)
    /// as a marker. Returns whether anything changed.
    pub fn merge(&mut self, incoming: &KartSnapshot) -> bool {
        let mut changed = false;
        for (name, value) in &incoming.fields {
            if value.trim().is_empty() {
                continue;
            }
            match self.fields.get_mut(name) {
                Some(existing) => {
                    if *existing == *value || (holds_no_value(name, value) && !holds_no_value(name, existing.as_str())) {
                        continue;
                    }
                    *existing = value.clone();
                    changed = true;
                }
                None => {
                    self.fields.insert(name.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Field values ordered by `column_order`, unknown columns last.
    pub fn ordered<'a>(&'a self, column_order: &'a [String]) -> Vec<(&'a str, &'a str)> {
        let mut ordered: Vec<(&str, &str)> =
            column_order.iter().filter_map(|name| self.get(name).map(|v| (name.as_str(), v))).collect();
        ordered.extend(self.iter().filter(|(name, _)| !column_order.iter().any(|c| c == name)));
        ordered
    }
}

/// Whether `value` stands for "nothing measured" in column `field`.
fn holds_no_value(field: &str, value: &str) -> bool {
    if LAST_LAP_FIELDS.contains(&field) { is_placeholder(value) } else { is_no_time_marker(value) }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KartSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut snapshot = KartSnapshot::new();
        for (k, v) in iter {
            snapshot.insert(k, v);
        }
        snapshot
    }
}
