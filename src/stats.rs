//! Windowed lap statistics
//!
//! Statistics cover a kart's last `window` (10) valid laps in the current
//! session. Results are served through the [`TieredCache`] under
//! `kart_stats:{session}:{kart}` with an adaptive tier, so the karts people
//! actually look at end up in the durable tiers.
//!
//! Placeholder and unparseable lap times do not count. With fewer valid laps
//! than the window the result is [`LapStats::InsufficientData`], which is not
//! cached: the next lap may complete the window.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::cache::TieredCache;
use crate::coalesce::{Coalescer, Debounced};
use crate::config::StatsConfig;
use crate::laps::{LapRecorder, LapStore, StoreOutcome};
use crate::types::{LapTime, NewLap};
use crate::{KartwallError, Result};

/// Cache key prefix for lap statistics.
pub const STATS_PREFIX: &str = "kart_stats:";

/// Statistics over a full window of laps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub kart_id: String,
    /// Lap numbers in the window, newest first.
    pub lap_numbers: Vec<u32>,
    pub best: String,
    pub worst: String,
    pub average: String,
    pub best_ms: u64,
    pub worst_ms: u64,
    pub average_ms: u64,
}

impl WindowStats {
    fn compute(kart_id: &str, window: &[(u32, LapTime)]) -> Option<Self> {
        let times: Vec<LapTime> = window.iter().map(|(_, time)| *time).collect();
        let best = times.iter().min().copied()?;
        let worst = times.iter().max().copied()?;
        let average = LapTime::mean(&times)?;
        Some(Self {
            kart_id: kart_id.to_string(),
            lap_numbers: window.iter().map(|(number, _)| *number).collect(),
            best: best.format(),
            worst: worst.format(),
            average: average.format(),
            best_ms: best.as_millis(),
            worst_ms: worst.as_millis(),
            average_ms: average.as_millis(),
        })
    }
}

/// Result of a statistics request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LapStats {
    Ready(WindowStats),
    /// Not enough valid laps yet; carries how many there are.
    InsufficientData { valid_laps: usize },
}

impl LapStats {
    pub fn ready(&self) -> Option<&WindowStats> {
        match self {
            LapStats::Ready(stats) => Some(stats),
            LapStats::InsufficientData { .. } => None,
        }
    }
}

/// Computes and caches per-kart statistics.
pub struct StatsAggregator {
    store: Arc<LapStore>,
    cache: Arc<TieredCache>,
    config: StatsConfig,
    refreshes: Coalescer<String, Option<LapStats>>,
}

impl StatsAggregator {
    pub fn new(store: Arc<LapStore>, cache: Arc<TieredCache>, config: StatsConfig) -> Self {
        let refreshes = Coalescer::new(config.refresh_max_wait());
        Self { store, cache, config, refreshes }
    }

    fn cache_key(session_id: &str, kart_id: &str) -> String {
        format!("{STATS_PREFIX}{session_id}:{kart_id}")
    }

    fn session_id(&self) -> Result<String> {
        self.store.current_session().map(|s| s.id).ok_or(KartwallError::NoActiveSession)
    }

    /// Statistics over the kart's last 10 valid laps.
    pub async fn get_last10_laps_stats(&self, kart_id: &str) -> Result<LapStats> {
        let key = Self::cache_key(&self.session_id()?, kart_id);
        if let Some(stats) = self.cache.get::<WindowStats>(&key).await {
            trace!(kart = kart_id, "Statistics served from cache");
            return Ok(LapStats::Ready(stats));
        }

        let stats = self.compute(kart_id).await?;
        if let LapStats::Ready(window) = &stats {
            let tier = self.cache.set_adaptive(&key, window).await;
            debug!(kart = kart_id, %tier, best = %window.best, "Statistics computed");
        }
        Ok(stats)
    }

    async fn compute(&self, kart_id: &str) -> Result<LapStats> {
        let laps = self.store.get_kart_laps(kart_id, Some(self.config.fetch_limit)).await?;
        let mut valid: Vec<(u32, LapTime)> =
            laps.iter().filter_map(|lap| Some((lap.lap_number, lap.parsed_time()?))).collect();

        if valid.len() < self.config.window {
            return Ok(LapStats::InsufficientData { valid_laps: valid.len() });
        }
        valid.sort_by(|a, b| b.0.cmp(&a.0));
        valid.truncate(self.config.window);

        Ok(WindowStats::compute(kart_id, &valid)
            .map(LapStats::Ready)
            .unwrap_or(LapStats::InsufficientData { valid_laps: 0 }))
    }

    /// Drop the cached statistics of one kart.
    pub async fn invalidate_kart_cache(&self, kart_id: &str) {
        if let Ok(session_id) = self.session_id() {
            self.cache.invalidate(&Self::cache_key(&session_id, kart_id)).await;
        }
    }

    /// Drop every cached statistic, across sessions, and cancel pending refreshes.
    pub async fn invalidate_all_stats(&self) {
        self.refreshes.clear();
        self.cache.invalidate_prefix(STATS_PREFIX).await;
        info!("All lap statistics invalidated");
    }

    /// Warm the cache for `kart_ids` concurrently. Returns how many are ready.
    pub async fn preload_popular_karts(&self, kart_ids: &[String]) -> usize {
        let results = futures::future::join_all(kart_ids.iter().map(|kart| self.get_last10_laps_stats(kart))).await;
        let ready = results.iter().filter(|r| matches!(r, Ok(LapStats::Ready(_)))).count();
        debug!(requested = kart_ids.len(), ready, "Preloaded kart statistics");
        ready
    }

    /// Recompute a kart's statistics once laps stop arriving for a moment.
    ///
    /// The handle resolves to `None` when a later call superseded this one,
    /// and to `Some(None)` when the recomputation failed.
    pub fn schedule_refresh(self: &Arc<Self>, kart_id: &str) -> Debounced<Option<LapStats>> {
        let this = self.clone();
        let kart = kart_id.to_string();
        self.refreshes.debounce(kart_id.to_string(), self.config.refresh_debounce(), move || async move {
            this.invalidate_kart_cache(&kart).await;
            this.get_last10_laps_stats(&kart).await.ok()
        })
    }

    /// Last refresh result for a kart.
    pub fn last_refresh(&self, kart_id: &str) -> Option<LapStats> {
        self.refreshes.result(&kart_id.to_string()).flatten()
    }
}

/// Records laps and keeps the statistics of the affected kart fresh.
pub struct RefreshingRecorder {
    store: Arc<LapStore>,
    stats: Arc<StatsAggregator>,
}

impl RefreshingRecorder {
    pub fn new(store: Arc<LapStore>, stats: Arc<StatsAggregator>) -> Self {
        Self { store, stats }
    }
}

#[async_trait]
impl LapRecorder for RefreshingRecorder {
    fn has_active_session(&self) -> bool {
        self.store.has_active_session()
    }

    async fn recorded_lap_count(&self, kart_id: &str) -> Result<u32> {
        self.store.recorded_lap_count(kart_id).await
    }

    async fn record_lap(&self, lap: NewLap) -> Result<StoreOutcome> {
        let kart_id = lap.kart_id.clone();
        let outcome = self.store.store_lap(lap).await?;
        if outcome == StoreOutcome::Stored {
            self.stats.invalidate_kart_cache(&kart_id).await;
            let _refresh = self.stats.schedule_refresh(&kart_id);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTier;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::store::MemoryDocumentStore;
    use std::time::Duration;

    const TIMES: [&str; 12] = [
        "1:26.500", "1:25.100", "--:--", "1:25.900", "1:24.823", "1:25.010", "1:25.220", "1:25.330", "1:24.990",
        "1:25.440", "1:26.010", "1:25.600",
    ];

    struct Fixture {
        stats: Arc<StatsAggregator>,
        store: Arc<LapStore>,
        cache: Arc<TieredCache>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), clock.clone()));
        let cache = Arc::new(TieredCache::in_memory(CacheConfig::default(), clock));
        let stats = Arc::new(StatsAggregator::new(store.clone(), cache.clone(), StatsConfig::default()));
        store.start_session("C1").await.unwrap();
        Fixture { stats, store, cache }
    }

    async fn record(store: &LapStore, kart: &str, times: &[&str]) {
        for (n, time) in times.iter().enumerate() {
            store.store_lap(NewLap::new(kart, n as u32 + 1, *time)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn fewer_than_ten_valid_laps_is_insufficient() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..10]).await;

        let stats = f.stats.get_last10_laps_stats("7").await.unwrap();
        assert_eq!(stats, LapStats::InsufficientData { valid_laps: 9 });
        assert_eq!(f.cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn ten_valid_laps_give_window_statistics() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..11]).await;

        let stats = f.stats.get_last10_laps_stats("7").await.unwrap();
        let window = stats.ready().expect("window should be full");
        assert_eq!(window.best, "1:24.823");
        assert_eq!(window.worst, "1:26.500");
        assert_eq!(window.lap_numbers, vec![11, 10, 9, 8, 7, 6, 5, 4, 2, 1]);
        assert_eq!(window.average_ms, (86_500 + 85_100 + 85_900 + 84_823 + 85_010 + 85_220 + 85_330 + 84_990 + 85_440 + 86_010) / 10);
    }

    #[tokio::test]
    async fn window_keeps_only_the_newest_laps() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES).await;

        let window = f.stats.get_last10_laps_stats("7").await.unwrap().ready().cloned().unwrap();
        assert_eq!(window.lap_numbers.first(), Some(&12));
        assert!(!window.lap_numbers.contains(&1));
        assert_eq!(window.worst, "1:26.010");
    }

    #[tokio::test]
    async fn results_are_cached_until_invalidated() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..11]).await;

        f.stats.get_last10_laps_stats("7").await.unwrap();
        f.stats.get_last10_laps_stats("7").await.unwrap();
        assert_eq!(f.cache.stats().l1_hits, 1);

        f.store.store_lap(NewLap::new("7", 12, "1:20.000")).await.unwrap();
        assert_eq!(f.stats.get_last10_laps_stats("7").await.unwrap().ready().unwrap().best, "1:24.823");

        f.stats.invalidate_kart_cache("7").await;
        assert_eq!(f.stats.get_last10_laps_stats("7").await.unwrap().ready().unwrap().best, "1:20.000");

        f.stats.invalidate_all_stats().await;
        let session = f.store.current_session().unwrap();
        assert!(!f.cache.in_memory_tier(&format!("kart_stats:{}:7", session.id)));
    }

    #[tokio::test]
    async fn popular_karts_move_to_durable_tiers() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..11]).await;
        for _ in 0..12 {
            f.stats.get_last10_laps_stats("7").await.unwrap();
        }
        let key = format!("kart_stats:{}:7", f.store.current_session().unwrap().id);
        f.stats.invalidate_kart_cache("7").await;
        f.stats.get_last10_laps_stats("7").await.unwrap();
        assert_eq!(f.cache.tier_for(f.cache.access_count(&key).await), CacheTier::Durable);
    }

    #[tokio::test]
    async fn preload_ignores_karts_without_data() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..11]).await;
        record(&f.store, "9", &TIMES[..3]).await;

        let ready = f.stats.preload_popular_karts(&["7".to_string(), "9".to_string(), "42".to_string()]).await;
        assert_eq!(ready, 1);
        let key = format!("kart_stats:{}:7", f.store.current_session().unwrap().id);
        assert!(f.cache.in_memory_tier(&key));
    }

    #[tokio::test]
    async fn requires_a_session() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), clock.clone()));
        let cache = Arc::new(TieredCache::in_memory(CacheConfig::default(), clock));
        let stats = StatsAggregator::new(store, cache, StatsConfig::default());
        assert!(matches!(stats.get_last10_laps_stats("7").await, Err(KartwallError::NoActiveSession)));
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_coalesces_refreshes() {
        let f = fixture().await;
        let recorder = RefreshingRecorder::new(f.store.clone(), f.stats.clone());

        for (n, time) in TIMES.iter().enumerate() {
            recorder.record_lap(NewLap::new("7", n as u32 + 1, *time)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(recorder.record_lap(NewLap::new("7", 12, TIMES[11])).await.unwrap(), StoreOutcome::Duplicate);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let refreshed = f.stats.last_refresh("7").expect("refresh should have run");
        assert_eq!(refreshed.ready().unwrap().lap_numbers.first(), Some(&12));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_everything_cancels_pending_refreshes() {
        let f = fixture().await;
        record(&f.store, "7", &TIMES[..11]).await;
        f.stats.get_last10_laps_stats("7").await.unwrap();
        f.stats.schedule_refresh("7");
        assert!(f.stats.refreshes.is_pending(&"7".to_string()));

        f.stats.invalidate_all_stats().await;
        assert!(!f.stats.refreshes.is_pending(&"7".to_string()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.stats.last_refresh("7"), None);
    }
}
