//! Inbound message envelopes
//!
//! Timing providers disagree on where the per-kart map lives. Known shapes,
//! tried in order:
//!
//! ```text
//! {"type": "karting_data", "drivers": {...}}
//! {"type": "karting_data", "data": {"drivers": {...}}}
//! {"karting_data": {"drivers": {...}}}
//! ```
//!
//! The drivers map is either an object keyed by kart id or an array of kart
//! objects carrying their id in one of [`KART_ID_FIELDS`]. Field-order
//! metadata travels next to the drivers map as `column_order` or `columns`.

use serde_json::{Map, Value};

use crate::types::KartSnapshot;
use crate::{KartwallError, Result};

/// Wrapper keys that may hold the drivers map, after the top level.
const WRAPPERS: &[&str] = &["data", "karting_data"];

/// Fields that identify a kart inside array-shaped drivers maps.
pub const KART_ID_FIELDS: &[&str] = &["kart", "kart_id", "kartId", "kart_number", "number", "id"];

const COLUMN_FIELDS: &[&str] = &["column_order", "columns"];

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Telemetry {
        karts: Vec<(String, KartSnapshot)>,
        column_order: Option<Vec<String>>,
    },
    /// Keepalive reply.
    Pong,
    /// Provider status; reserved, not forwarded.
    Status(Value),
    /// Provider-side error report; reserved, not forwarded.
    Error(String),
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| KartwallError::malformed(format!("not JSON: {e}")))?;
        let Value::Object(root) = value else {
            return Err(KartwallError::malformed("top level is not an object"));
        };

        match root.get("type").and_then(Value::as_str) {
            Some("pong") => return Ok(Envelope::Pong),
            Some("status_update") => return Ok(Envelope::Status(Value::Object(root))),
            Some("error") => {
                let message = ["message", "error", "reason"]
                    .iter()
                    .find_map(|key| root.get(*key).and_then(Value::as_str))
                    .unwrap_or("unspecified")
                    .to_string();
                return Ok(Envelope::Error(message));
            }
            _ => {}
        }

        let container = std::iter::once(&root)
            .chain(WRAPPERS.iter().filter_map(|key| root.get(*key).and_then(Value::as_object)))
            .find(|object| object.get("drivers").is_some_and(|drivers| !drivers.is_null()))
            .ok_or_else(|| KartwallError::malformed("no drivers map in any known shape"))?;

        let karts = parse_drivers(&container["drivers"])?;
        let column_order = COLUMN_FIELDS
            .iter()
            .find_map(|key| container.get(*key).or_else(|| root.get(*key)))
            .and_then(Value::as_array)
            .map(|columns| columns.iter().filter_map(Value::as_str).map(str::to_string).collect());

        Ok(Envelope::Telemetry { karts, column_order })
    }
}

fn parse_drivers(drivers: &Value) -> Result<Vec<(String, KartSnapshot)>> {
    match drivers {
        Value::Object(map) => Ok(map
            .iter()
            .filter_map(|(kart_id, fields)| Some((kart_id.trim().to_string(), KartSnapshot::from_json(fields.as_object()?))))
            .filter(|(kart_id, _)| !kart_id.is_empty())
            .collect()),
        Value::Array(rows) => Ok(rows.iter().filter_map(Value::as_object).filter_map(array_row).collect()),
        other => Err(KartwallError::malformed(format!("drivers is neither an object nor an array: {other}"))),
    }
}

fn array_row(row: &Map<String, Value>) -> Option<(String, KartSnapshot)> {
    let snapshot = KartSnapshot::from_json(row);
    let kart_id = snapshot.first_of(KART_ID_FIELDS)?.to_string();
    (!kart_id.is_empty()).then_some((kart_id, snapshot))
}
