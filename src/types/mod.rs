//! Core types for karting telemetry and lap recording.
//!
//! ## Architecture
//!
//! - [`KartSnapshot`] is one kart's accumulated timing columns
//! - [`LapTime`] is the lap-time codec (parse, format, placeholder detection)
//! - [`Lap`], [`Session`] and [`KartHistory`] are the persisted records
//! - [`TelemetryUpdate`] is what subscribers receive per inbound message
//! - [`ConnectionState`] is the observable connection lifecycle
//!
//! ## Usage Example
//!
//! ```rust
//! use kartwall::types::{KartSnapshot, LapTime};
//!
//! let mut kart: KartSnapshot = [("last_lap", "1:25.100"), ("position", "2")].into_iter().collect();
//! kart.merge(&[("last_lap", "--:--")].into_iter().collect());
//!
//! // A placeholder never erases a real reading
//! assert_eq!(kart.last_lap_time(), Some("1:25.100"));
//! assert_eq!(LapTime::parse("1:25.100").unwrap().as_millis(), 85_100);
//! ```

mod connection_state;
mod lap;
pub mod lap_time;
mod snapshot;
mod update;
mod update_rate;

pub use connection_state::ConnectionState;
pub use lap::{KartHistory, Lap, NewLap, Session};
pub use lap_time::{LapTime, is_no_time_marker, is_placeholder};
pub use snapshot::{KartSnapshot, LAST_LAP_FIELDS};
pub use update::TelemetryUpdate;
pub use update_rate::UpdateRate;
