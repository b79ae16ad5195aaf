//! Live karting telemetry ingestion.
//!
//! Kartwall connects to a circuit's live timing feed, keeps an up-to-date
//! snapshot of every kart, detects lap completions from the feed's "last lap"
//! column and records each lap exactly once. Windowed lap statistics are
//! served through a three-tier cache.
//!
//! # Features
//!
//! - **Resilient feed client**: keepalive, bounded connect timeout, fixed-delay
//!   reconnects, tolerant parsing of several message shapes
//! - **Lap detection**: per-kart state machine that survives reconnects and
//!   restarts within a session
//! - **Exactly-once recording**: deterministic lap ids, duplicates are no-ops
//! - **Tiered cache**: memory, embedded and durable tiers with adaptive
//!   promotion
//! - **Paging**: cursor-based lap history with read-ahead
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use kartwall::{Kartwall, KartwallConfig};
//!
//! #[tokio::main]
//! async fn main() -> kartwall::Result<()> {
//!     let kartwall = Kartwall::builder(KartwallConfig::default()).build().await?;
//!     kartwall.start_session("C1").await?;
//!     kartwall.enable_lap_detection(true);
//!
//!     if kartwall.connect("C1").await {
//!         let mut updates = kartwall.subscribe();
//!         while let Some(update) = updates.next().await {
//!             println!("{} karts", update.karts.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod clock;
pub mod config;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Feed ingestion
pub mod connection;
mod driver;
pub mod stream;
pub mod transport;
pub mod transports;

// Recording and derived data
pub mod cache;
pub mod coalesce;
pub mod laps;
pub mod pagination;
pub mod stats;
pub mod store;

// Core exports
pub use config::KartwallConfig;
pub use error::*;
pub use types::*;

pub use cache::{CacheStats, CacheTier, TieredCache};
pub use coalesce::{Coalescer, Debounced};
pub use connection::TelemetryConnectionManager;
pub use laps::{KartLapPages, LapDetector, LapStore, SessionExport, SessionLapPages, SessionStatistics, StoreOutcome};
pub use pagination::{Page, PageSource, PagedFetcher};
pub use stats::{LapStats, StatsAggregator, WindowStats};
pub use transport::{Transport, TransportConnection};

use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use clock::{SharedClock, SystemClock};
use laps::{KartLapSource, SessionLapSource};
use stats::RefreshingRecorder;
use store::{DocumentStore, FileKeyValueStore, KeyValueStore, MemoryDocumentStore, MemoryKeyValueStore};

/// Builder for a [`Kartwall`] engine.
///
/// Every collaborator has a default: the WebSocket transport (feature
/// `websocket`), an in-memory document store, the system clock, and cache
/// tiers under `storage.cache_dir` (in memory when unset).
pub struct KartwallBuilder {
    config: KartwallConfig,
    transport: Option<Arc<dyn Transport>>,
    documents: Option<Arc<dyn DocumentStore>>,
    tiers: Option<(Arc<dyn KeyValueStore>, Arc<dyn KeyValueStore>)>,
    clock: Option<SharedClock>,
}

impl KartwallBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Backends for the L2 and L3 cache tiers.
    pub fn cache_tiers(mut self, l2: Arc<dyn KeyValueStore>, l3: Arc<dyn KeyValueStore>) -> Self {
        self.tiers = Some((l2, l3));
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and wire the engine together.
    pub async fn build(self) -> Result<Kartwall> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let documents: Arc<dyn DocumentStore> = match self.documents {
            Some(documents) => documents,
            None => Arc::new(MemoryDocumentStore::new()),
        };

        let (l2, l3) = match (self.tiers, &config.storage.cache_dir) {
            (Some(tiers), _) => tiers,
            (None, Some(dir)) => {
                let l2: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open("l2-file", dir.join("l2")).await?);
                let l3: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open("l3-file", dir.join("l3")).await?);
                (l2, l3)
            }
            (None, None) => {
                let l2: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new("l2-memory"));
                let l3: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new("l3-memory"));
                (l2, l3)
            }
        };

        let cache = Arc::new(TieredCache::new(config.cache.clone(), l2, l3, clock.clone()));
        let store = Arc::new(LapStore::new(documents, clock.clone()));
        let stats = Arc::new(StatsAggregator::new(store.clone(), cache.clone(), config.stats.clone()));
        let recorder = Arc::new(RefreshingRecorder::new(store.clone(), stats.clone()));
        let detector = Arc::new(LapDetector::new(recorder));
        let connection =
            TelemetryConnectionManager::with_lap_detector(config.feed.clone(), transport, clock, detector.clone());

        info!(url_template = %config.feed.url_template, "Kartwall engine ready");
        Ok(Kartwall { config, cache, store, stats, detector, connection })
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(transports::WebSocketTransport::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Err(KartwallError::config("no transport given and the websocket feature is disabled"))
}

/// The ingestion engine: one feed connection, one lap store, one cache.
///
/// Create it once and share it; every component it owns is safe to use
/// from concurrent tasks.
///
/// ```rust
/// use kartwall::{Kartwall, KartwallConfig};
/// use kartwall::types::NewLap;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> kartwall::Result<()> {
/// let kartwall = Kartwall::builder(KartwallConfig::default())
///     .transport(std::sync::Arc::new(kartwall::transports::ReplayTransport::new(
///         "laps.jsonl",
///         std::time::Duration::from_millis(100),
///     )))
///     .build()
///     .await?;
///
/// kartwall.start_session("C1").await?;
/// kartwall.store_lap(NewLap::new("7", 1, "1:25.100")).await?;
/// assert_eq!(kartwall.get_kart_laps("7", None).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Kartwall {
    config: KartwallConfig,
    cache: Arc<TieredCache>,
    store: Arc<LapStore>,
    stats: Arc<StatsAggregator>,
    detector: Arc<LapDetector>,
    connection: TelemetryConnectionManager,
}

impl Kartwall {
    pub fn builder(config: KartwallConfig) -> KartwallBuilder {
        KartwallBuilder { config, transport: None, documents: None, tiers: None, clock: None }
    }

    pub fn config(&self) -> &KartwallConfig {
        &self.config
    }

    pub fn connection(&self) -> &TelemetryConnectionManager {
        &self.connection
    }

    pub fn lap_store(&self) -> &Arc<LapStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    // Feed

    pub async fn connect(&self, circuit_id: &str) -> bool {
        self.connection.connect(circuit_id).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub async fn reconnect(&self) -> bool {
        self.connection.reconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe(&self) -> BoxStream<'static, Arc<TelemetryUpdate>> {
        self.connection.subscribe()
    }

    pub fn subscribe_throttled(&self, rate: UpdateRate) -> BoxStream<'static, Arc<TelemetryUpdate>> {
        self.connection.subscribe_throttled(rate)
    }

    pub fn all_karts_data(&self) -> BTreeMap<String, KartSnapshot> {
        self.connection.all_karts_data()
    }

    pub fn column_order(&self) -> Vec<String> {
        self.connection.column_order()
    }

    pub fn enable_lap_detection(&self, enabled: bool) {
        self.connection.enable_lap_detection(enabled)
    }

    pub fn lap_counters(&self) -> BTreeMap<String, u32> {
        self.connection.lap_counters()
    }

    // Sessions and laps

    /// Start a new recording session; lap counting starts over.
    pub async fn start_session(&self, circuit_id: &str) -> Result<Session> {
        let session = self.store.start_session(circuit_id).await?;
        self.detector.reset();
        Ok(session)
    }

    pub async fn stop_session(&self) -> Result<Option<Session>> {
        self.store.stop_session().await
    }

    pub fn current_session(&self) -> Option<Session> {
        self.store.current_session()
    }

    pub async fn store_lap(&self, lap: NewLap) -> Result<StoreOutcome> {
        self.store.store_lap(lap).await
    }

    /// Laps of one kart, newest first.
    pub async fn get_kart_laps(&self, kart_id: &str, limit: Option<usize>) -> Result<Vec<Lap>> {
        self.store.get_kart_laps(kart_id, limit).await
    }

    pub async fn get_session_statistics(&self) -> Result<SessionStatistics> {
        self.store.get_session_statistics().await
    }

    pub async fn export_session_data(&self) -> Result<SessionExport> {
        self.store.export_session_data().await
    }

    /// Every lap recorded from now on.
    pub fn lap_events(&self) -> broadcast::Receiver<Arc<Lap>> {
        self.store.subscribe()
    }

    // Statistics

    pub async fn get_last10_laps_stats(&self, kart_id: &str) -> Result<LapStats> {
        self.stats.get_last10_laps_stats(kart_id).await
    }

    pub async fn invalidate_kart_cache(&self, kart_id: &str) {
        self.stats.invalidate_kart_cache(kart_id).await
    }

    pub async fn invalidate_all_stats(&self) {
        self.stats.invalidate_all_stats().await
    }

    pub async fn preload_popular_karts(&self, kart_ids: &[String]) -> usize {
        self.stats.preload_popular_karts(kart_ids).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // Paging

    /// Paged view of one kart's laps in the current session, by lap number.
    pub fn kart_lap_pages(&self, kart_id: &str) -> Result<KartLapPages> {
        let session = self.store.current_session().ok_or(KartwallError::NoActiveSession)?;
        let source = KartLapSource::new(self.store.clone(), session.id, kart_id);
        Ok(PagedFetcher::new(source, self.config.pagination.page_size, self.config.pagination.prefetch_pages))
    }

    /// Paged view of every lap in the current session, in recording order.
    pub fn session_lap_pages(&self) -> Result<SessionLapPages> {
        let session = self.store.current_session().ok_or(KartwallError::NoActiveSession)?;
        let source = SessionLapSource::new(self.store.clone(), session.id);
        Ok(PagedFetcher::new(source, self.config.pagination.page_size, self.config.pagination.prefetch_pages))
    }
}
