//! Lap boundary detection
//!
//! The timing feed has no "lap completed" event. Each kart's "last lap time"
//! column is simply overwritten when the kart crosses the line, and in
//! between it is repeated, blanked or replaced by placeholders. A lap is
//! therefore detected when that column changes to a new real value.
//!
//! Per kart the detector keeps the last real value it saw and a lap counter.
//! The first real value seen for a kart is a lap only if the store has
//! nothing recorded for that kart yet; otherwise the detector picks up
//! counting where the store left off, which keeps numbering stable across
//! reconnects and restarts within a session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::store::{LapStore, StoreOutcome};
use crate::Result;
use crate::types::{KartSnapshot, NewLap, is_placeholder};

/// Where detected laps go.
#[async_trait]
pub trait LapRecorder: Send + Sync + 'static {
    /// Whether laps can be recorded right now.
    fn has_active_session(&self) -> bool;

    /// Highest lap number recorded for `kart_id` in the active session, 0 if none.
    async fn recorded_lap_count(&self, kart_id: &str) -> Result<u32>;

    async fn record_lap(&self, lap: NewLap) -> Result<StoreOutcome>;
}

#[async_trait]
impl LapRecorder for LapStore {
    fn has_active_session(&self) -> bool {
        LapStore::has_active_session(self)
    }

    async fn recorded_lap_count(&self, kart_id: &str) -> Result<u32> {
        LapStore::recorded_lap_count(self, kart_id).await
    }

    async fn record_lap(&self, lap: NewLap) -> Result<StoreOutcome> {
        self.store_lap(lap).await
    }
}

#[derive(Debug, Default)]
struct KartLapState {
    last_time: Option<String>,
    laps: u32,
}

enum Step {
    Ignore,
    Resolve,
    Emit(u32),
}

/// Turns merged kart snapshots into discrete lap events.
pub struct LapDetector {
    recorder: Arc<dyn LapRecorder>,
    karts: Mutex<HashMap<String, KartLapState>>,
}

impl LapDetector {
    pub fn new(recorder: Arc<dyn LapRecorder>) -> Self {
        Self { recorder, karts: Mutex::new(HashMap::new()) }
    }

    /// Feed one merged snapshot. Returns the lap number emitted, if any.
    ///
    /// Recording failures are logged and swallowed; the counter still
    /// advances so the same reading is never counted twice.
    pub async fn observe(&self, kart_id: &str, snapshot: &KartSnapshot) -> Option<u32> {
        let lap_time = snapshot.last_lap_time()?;
        if is_placeholder(lap_time) || !self.recorder.has_active_session() {
            return None;
        }

        let step = {
            let mut karts = self.karts.lock();
            let state = karts.entry(kart_id.to_string()).or_default();
            match state.last_time.as_deref() {
                None => Step::Resolve,
                Some(previous) if previous == lap_time => Step::Ignore,
                Some(_) => {
                    state.laps += 1;
                    state.last_time = Some(lap_time.to_string());
                    Step::Emit(state.laps)
                }
            }
        };

        let lap_number = match step {
            Step::Ignore => return None,
            Step::Emit(lap_number) => lap_number,
            Step::Resolve => self.first_reading(kart_id, lap_time).await?,
        };

        let lap = NewLap::new(kart_id, lap_number, lap_time).with_snapshot(snapshot.clone());
        match self.recorder.record_lap(lap).await {
            Ok(outcome) => debug!(kart = kart_id, lap = lap_number, time = lap_time, ?outcome, "Lap detected"),
            Err(e) => warn!(kart = kart_id, lap = lap_number, error = %e, "Failed to record detected lap"),
        }
        Some(lap_number)
    }

    /// First real reading for a kart: a new lap 1, or a resume point.
    async fn first_reading(&self, kart_id: &str, lap_time: &str) -> Option<u32> {
        let recorded = match self.recorder.recorded_lap_count(kart_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(kart = kart_id, error = %e, "Cannot read recorded laps, will retry on next update");
                return None;
            }
        };

        let mut karts = self.karts.lock();
        let state = karts.entry(kart_id.to_string()).or_default();
        if state.last_time.is_some() {
            return None;
        }
        state.last_time = Some(lap_time.to_string());
        if recorded > 0 {
            state.laps = recorded;
            trace!(kart = kart_id, recorded, "Resuming lap count from store");
            return None;
        }
        state.laps = 1;
        Some(1)
    }

    /// Lap counter of every kart seen so far.
    pub fn lap_counters(&self) -> BTreeMap<String, u32> {
        self.karts.lock().iter().map(|(kart, state)| (kart.clone(), state.laps)).collect()
    }

    /// Forget every kart.
    pub fn reset(&self) {
        let cleared = {
            let mut karts = self.karts.lock();
            let cleared = karts.len();
            karts.clear();
            cleared
        };
        debug!(cleared, "Lap detector reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KartwallError;
    use crate::clock::ManualClock;
    use crate::store::MemoryDocumentStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn snapshot(field: &str, value: &str) -> KartSnapshot {
        [(field, value)].into_iter().collect()
    }

    async fn detector() -> (LapDetector, Arc<LapStore>) {
        let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), Arc::new(ManualClock::new(1_000))));
        store.start_session("C1").await.unwrap();
        (LapDetector::new(store.clone()), store)
    }

    #[tokio::test]
    async fn detects_each_new_reading_once() {
        let (detector, store) = detector().await;
        let readings = [
            "--:--", "1:26.500", "1:26.500", "1:25.100", "", "1:25.900", "1:24.823", "-", "1:25.010", "1:25.220",
            "1:25.330", "1:24.990", "1:25.440",
        ];

        let mut emitted = Vec::new();
        for reading in readings {
            if let Some(lap) = detector.observe("7", &snapshot("last_lap", reading)).await {
                emitted.push(lap);
            }
        }

        assert_eq!(emitted, (1..=9).collect::<Vec<_>>());
        assert_eq!(store.recorded_lap_count("7").await.unwrap(), 9);
        let laps = store.get_kart_laps("7", None).await.unwrap();
        assert_eq!(laps.last().map(|l| l.lap_time.as_str()), Some("1:26.500"));
        assert_eq!(laps.first().map(|l| l.lap_number), Some(9));
    }

    #[tokio::test]
    async fn resumes_from_recorded_count() {
        let (detector, store) = detector().await;
        for n in 1..=3 {
            store.store_lap(NewLap::new("7", n, format!("1:2{n}.000"))).await.unwrap();
        }

        assert_eq!(detector.observe("7", &snapshot("lastLapTime", "1:23.000")).await, None);
        assert_eq!(detector.observe("7", &snapshot("lastLapTime", "1:22.500")).await, Some(4));
        assert_eq!(detector.lap_counters().get("7"), Some(&4));
    }

    #[tokio::test]
    async fn field_spellings_follow_priority() {
        let (detector, _) = detector().await;
        let mut kart = snapshot("Last Lap", "1:30.000");
        kart.insert("last_lap_time", "1:26.000");
        assert_eq!(detector.observe("7", &kart).await, Some(1));

        kart.insert("Last Lap", "1:20.000");
        assert_eq!(detector.observe("7", &kart).await, None);
    }

    #[tokio::test]
    async fn idle_without_a_session() {
        let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), Arc::new(ManualClock::new(0))));
        let detector = LapDetector::new(store);
        assert_eq!(detector.observe("7", &snapshot("last_lap", "1:26.500")).await, None);
        assert!(detector.lap_counters().is_empty());
    }

    #[tokio::test]
    async fn reset_forgets_every_kart() {
        let (detector, _) = detector().await;
        detector.observe("7", &snapshot("last_lap", "1:26.500")).await;
        detector.reset();
        assert!(detector.lap_counters().is_empty());

        // The store already has lap 1, so the same reading only resumes.
        assert_eq!(detector.observe("7", &snapshot("last_lap", "1:26.500")).await, None);
        assert_eq!(detector.lap_counters().get("7"), Some(&1));
    }

    struct FlakyRecorder {
        fail: AtomicBool,
        recorded: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl LapRecorder for FlakyRecorder {
        fn has_active_session(&self) -> bool {
            true
        }

        async fn recorded_lap_count(&self, _kart_id: &str) -> Result<u32> {
            Ok(0)
        }

        async fn record_lap(&self, lap: NewLap) -> Result<StoreOutcome> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KartwallError::store_unavailable("laps", "offline"));
            }
            self.recorded.lock().push(lap.lap_number);
            Ok(StoreOutcome::Stored)
        }
    }

    #[tokio::test]
    async fn failed_recording_still_advances_the_counter() {
        let recorder = Arc::new(FlakyRecorder { fail: AtomicBool::new(false), recorded: Mutex::new(Vec::new()) });
        let detector = LapDetector::new(recorder.clone());

        detector.observe("7", &snapshot("last_lap", "1:26.500")).await;
        recorder.fail.store(true, Ordering::SeqCst);
        assert_eq!(detector.observe("7", &snapshot("last_lap", "1:25.100")).await, Some(2));
        assert_eq!(detector.observe("7", &snapshot("last_lap", "1:25.100")).await, None);
        recorder.fail.store(false, Ordering::SeqCst);
        detector.observe("7", &snapshot("last_lap", "1:24.900")).await;

        assert_eq!(*recorder.recorded.lock(), vec![1, 3]);
    }

    proptest! {
        #[test]
        fn emitted_laps_are_consecutive(readings in proptest::collection::vec(prop_oneof![
            Just("--:--".to_string()),
            Just(String::new()),
            (60_000u64..90_000).prop_map(|ms| crate::types::LapTime::from_millis(ms).unwrap().format()),
        ], 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let emitted = runtime.block_on(async {
                let (detector, _) = detector().await;
                let mut emitted = Vec::new();
                for reading in &readings {
                    if let Some(lap) = detector.observe("7", &snapshot("last_lap", reading)).await {
                        emitted.push(lap);
                    }
                }
                emitted
            });
            prop_assert_eq!(emitted.clone(), (1..=emitted.len() as u32).collect::<Vec<_>>());
        }
    }
}
