//! Recorded laps, sessions and per-kart rollups

use serde::{Deserialize, Serialize};

use super::lap_time::{LapTime, is_placeholder};
use super::snapshot::KartSnapshot;

/// A lap as emitted by the detector or submitted by a caller, before the
/// store assigns it to the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLap {
    pub kart_id: String,
    pub lap_number: u32,
    pub lap_time: String,
    pub raw_snapshot: KartSnapshot,
}

impl NewLap {
    pub fn new(kart_id: impl Into<String>, lap_number: u32, lap_time: impl Into<String>) -> Self {
        Self {
            kart_id: kart_id.into(),
            lap_number,
            lap_time: lap_time.into().trim().to_string(),
            raw_snapshot: KartSnapshot::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: KartSnapshot) -> Self {
        self.raw_snapshot = snapshot;
        self
    }
}

/// A persisted lap. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lap {
    pub id: String,
    pub session_id: String,
    pub kart_id: String,
    pub lap_number: u32,
    pub lap_time: String,
    /// Parsed duration; absent for placeholder or unparseable times.
    pub duration_ms: Option<u64>,
    pub raw_snapshot: KartSnapshot,
    /// Epoch milliseconds.
    pub created_at: u64,
}

impl Lap {
    /// Deterministic document id for a lap.
    pub fn id_for(session_id: &str, kart_id: &str, lap_number: u32) -> String {
        format!("{session_id}_{kart_id}_{lap_number}")
    }

    pub fn from_new(session_id: &str, lap: NewLap, created_at: u64) -> Self {
        let duration_ms = parse_valid(&lap.lap_time).map(LapTime::as_millis);
        Self {
            id: Self::id_for(session_id, &lap.kart_id, lap.lap_number),
            session_id: session_id.to_string(),
            kart_id: lap.kart_id,
            lap_number: lap.lap_number,
            lap_time: lap.lap_time,
            duration_ms,
            raw_snapshot: lap.raw_snapshot,
            created_at,
        }
    }

    /// The parsed lap time when it is a real reading.
    pub fn parsed_time(&self) -> Option<LapTime> {
        self.duration_ms.and_then(LapTime::from_millis)
    }
}

fn parse_valid(lap_time: &str) -> Option<LapTime> {
    if is_placeholder(lap_time) { None } else { LapTime::parse(lap_time).ok() }
}

/// The bounded period during which one circuit's telemetry is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub circuit_id: String,
    /// Epoch milliseconds.
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub active: bool,
}

impl Session {
    pub fn start(circuit_id: impl Into<String>, started_at: u64) -> Self {
        let circuit_id = circuit_id.into();
        Self { id: format!("{circuit_id}-{started_at}"), circuit_id, started_at, ended_at: None, active: true }
    }
}

/// Summary of one kart's laps within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KartHistory {
    pub kart_id: String,
    pub lap_count: u32,
    pub last_lap_number: u32,
    pub best_lap: Option<String>,
    pub best_ms: Option<u64>,
    pub last_lap: Option<String>,
}

impl KartHistory {
    pub fn new(kart_id: impl Into<String>) -> Self {
        Self { kart_id: kart_id.into(), ..Self::default() }
    }

    /// Fold one newly stored lap into the rollup.
    pub fn record(&mut self, lap: &Lap) {
        self.lap_count += 1;
        if lap.lap_number >= self.last_lap_number {
            self.last_lap_number = lap.lap_number;
            self.last_lap = Some(lap.lap_time.clone());
        }
        if let Some(time) = lap.parsed_time() {
            if self.best_ms.is_none_or(|best| time.as_millis() < best) {
                self.best_ms = Some(time.as_millis());
                self.best_lap = Some(time.format());
            }
        }
    }

    /// Rebuild a rollup from stored laps.
    pub fn from_laps<'a>(kart_id: &str, laps: impl IntoIterator<Item = &'a Lap>) -> Self {
        let mut history = Self::new(kart_id);
        for lap in laps {
            history.record(lap);
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(number: u32, time: &str) -> Lap {
        Lap::from_new("C1-1000", NewLap::new("7", number, time), 1000 + number as u64)
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(Lap::id_for("C1-1000", "7", 3), "C1-1000_7_3");
        assert_eq!(lap(3, "1:25.100").id, "C1-1000_7_3");
    }

    #[test]
    fn placeholder_laps_have_no_duration() {
        assert_eq!(lap(1, "--:--").duration_ms, None);
        assert_eq!(lap(1, "1:25.100").duration_ms, Some(85_100));
    }

    #[test]
    fn history_tracks_count_best_and_last() {
        let laps = [lap(1, "1:26.500"), lap(2, "1:25.100"), lap(3, "--:--"), lap(4, "1:27.000")];
        let history = KartHistory::from_laps("7", &laps);

        assert_eq!(history.lap_count, 4);
        assert_eq!(history.last_lap_number, 4);
        assert_eq!(history.last_lap.as_deref(), Some("1:27.000"));
        assert_eq!(history.best_lap.as_deref(), Some("1:25.100"));
    }

    #[test]
    fn session_ids_combine_circuit_and_start() {
        let session = Session::start("C1", 1_700_000_000_000);
        assert_eq!(session.id, "C1-1700000000000");
        assert!(session.active);
    }
}
