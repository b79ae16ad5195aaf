//! Lap detection, exactly-once recording and paged lap history
//!
//! ```text
//! merged snapshot ──► LapDetector ──► LapRecorder ──► LapStore ──► DocumentStore
//!                     (per-kart state)                (sessions, laps, kart_histories)
//! ```

mod detector;
mod pages;
mod store;

pub use detector::{LapDetector, LapRecorder};
pub use pages::{KartLapPages, KartLapSource, SessionLapPages, SessionLapSource};
pub use store::{BestLap, KART_HISTORIES, LAPS, LapStore, SESSIONS, SessionExport, SessionStatistics, StoreOutcome};
