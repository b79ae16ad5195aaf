//! Telemetry connection manager

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::envelope::Envelope;
use crate::clock::SharedClock;
use crate::config::FeedConfig;
use crate::driver::Driver;
use crate::laps::LapDetector;
use crate::stream::ThrottleExt;
use crate::transport::{Transport, TransportConnection};
use crate::types::{ConnectionState, KartSnapshot, TelemetryUpdate, UpdateRate};
use crate::KartwallError;

/// Accumulated view of the connected circuit.
#[derive(Debug, Default)]
struct KartCache {
    snapshots: BTreeMap<String, KartSnapshot>,
    column_order: Vec<String>,
}

/// State shared between the manager and its driver task.
pub(crate) struct Shared {
    pub(crate) config: FeedConfig,
    pub(crate) transport: Arc<dyn Transport>,
    clock: SharedClock,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    karts: Mutex<KartCache>,
    updates_tx: broadcast::Sender<Arc<TelemetryUpdate>>,
    malformed: AtomicU64,
    detection: AtomicBool,
    detector: Option<Arc<LapDetector>>,
}

impl Shared {
    /// Publish a state change unless a manual disconnect already took over.
    pub(crate) fn set_state(&self, state: ConnectionState, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    pub(crate) fn record_error(&self, error: &KartwallError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Open a connection bounded by the connect timeout.
    pub(crate) async fn open(&self, url: &str) -> crate::Result<Box<dyn TransportConnection>> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.connect(url)).await {
            Ok(result) => result,
            Err(_) => Err(KartwallError::Timeout { duration: timeout }),
        }
    }

    /// Process one inbound frame.
    pub(crate) async fn ingest(&self, circuit_id: &str, text: &str, cancel: &CancellationToken) {
        let (karts, column_order) = match Envelope::parse(text) {
            Ok(Envelope::Telemetry { karts, column_order }) => (karts, column_order),
            Ok(Envelope::Pong) => {
                trace!("Keepalive acknowledged");
                return;
            }
            Ok(Envelope::Status(status)) => {
                debug!(%status, "Feed status update");
                return;
            }
            Ok(Envelope::Error(message)) => {
                warn!(circuit = circuit_id, message, "Feed reported an error");
                return;
            }
            Err(e) => {
                let dropped = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(error = %e, dropped, "Dropping malformed message");
                return;
            }
        };

        let (merged, column_order) = {
            let mut cache = self.karts.lock();
            // A manual disconnect clears the cache; nothing may refill it after.
            if cancel.is_cancelled() {
                return;
            }
            if let Some(order) = column_order {
                cache.column_order = order;
            }
            let merged: BTreeMap<String, KartSnapshot> = karts
                .into_iter()
                .map(|(kart_id, incoming)| {
                    let snapshot = cache.snapshots.entry(kart_id.clone()).or_default();
                    snapshot.merge(&incoming);
                    (kart_id, snapshot.clone())
                })
                .collect();
            (merged, cache.column_order.clone())
        };
        if merged.is_empty() {
            return;
        }

        if self.detection.load(Ordering::Acquire) {
            if let Some(detector) = &self.detector {
                for (kart_id, snapshot) in &merged {
                    detector.observe(kart_id, snapshot).await;
                }
            }
        }

        let update = TelemetryUpdate {
            circuit_id: circuit_id.to_string(),
            karts: merged,
            column_order,
            received_at: self.clock.now_ms(),
        };
        trace!(karts = update.karts.len(), "Telemetry update");
        let _ = self.updates_tx.send(Arc::new(update));
    }

    fn clear(&self) {
        let mut cache = self.karts.lock();
        cache.snapshots.clear();
        cache.column_order.clear();
        drop(cache);
        if let Some(detector) = &self.detector {
            detector.reset();
        }
    }
}

struct ActiveConnection {
    circuit_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    active: Option<ActiveConnection>,
    last_circuit: Option<String>,
}

/// Reconnecting client for one circuit's live timing feed.
///
/// Holds at most one connection. Inbound karts are merged into a per-kart
/// snapshot cache, fed to the lap detector when detection is enabled, and
/// broadcast to subscribers as [`TelemetryUpdate`]s.
pub struct TelemetryConnectionManager {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<Control>,
    /// Token of the connect attempt in flight, reachable without `control`.
    attempt: Mutex<Option<CancellationToken>>,
}

impl TelemetryConnectionManager {
    pub fn new(config: FeedConfig, transport: Arc<dyn Transport>, clock: SharedClock) -> Self {
        Self::build(config, transport, clock, None)
    }

    /// Manager that runs `detector` on merged snapshots while detection is enabled.
    pub fn with_lap_detector(
        config: FeedConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
        detector: Arc<LapDetector>,
    ) -> Self {
        Self::build(config, transport, clock, Some(detector))
    }

    fn build(config: FeedConfig, transport: Arc<dyn Transport>, clock: SharedClock, detector: Option<Arc<LapDetector>>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (updates_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let shared = Shared {
            config,
            transport,
            clock,
            state_tx,
            last_error: Mutex::new(None),
            karts: Mutex::new(KartCache::default()),
            updates_tx,
            malformed: AtomicU64::new(0),
            detection: AtomicBool::new(false),
            detector,
        };
        Self { shared: Arc::new(shared), control: tokio::sync::Mutex::new(Control::default()), attempt: Mutex::new(None) }
    }

    /// Connect to `circuit_id`'s feed. Returns whether the connection is up.
    ///
    /// Connecting to the circuit that is already connected does nothing. Any
    /// other existing connection is closed first and its state discarded.
    pub async fn connect(&self, circuit_id: &str) -> bool {
        let mut control = self.control.lock().await;
        if let Some(active) = &control.active {
            if active.circuit_id == circuit_id && self.state().is_connected() {
                debug!(circuit = circuit_id, "Already connected");
                return true;
            }
        }
        self.teardown(&mut control).await;
        control.last_circuit = Some(circuit_id.to_string());

        let cancel = CancellationToken::new();
        *self.attempt.lock() = Some(cancel.clone());
        let url = self.shared.config.url_for(circuit_id);
        info!(circuit = circuit_id, url, "Connecting to timing feed");
        self.shared.set_state(ConnectionState::Connecting, &cancel);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.shared.open(&url) => Some(result),
        };
        *self.attempt.lock() = None;

        let connection = match opened {
            None => {
                info!(circuit = circuit_id, "Connection attempt abandoned by disconnect");
                return false;
            }
            Some(Ok(_)) if cancel.is_cancelled() => {
                info!(circuit = circuit_id, "Connection attempt abandoned by disconnect");
                return false;
            }
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                warn!(circuit = circuit_id, error = %e, "Connection failed");
                self.shared.record_error(&e);
                self.shared.set_state(ConnectionState::Disconnected, &cancel);
                return false;
            }
        };

        *self.shared.last_error.lock() = None;
        self.shared.set_state(ConnectionState::Connected, &cancel);
        let task = Driver::spawn(self.shared.clone(), connection, circuit_id.to_string(), url, cancel.clone());
        control.active = Some(ActiveConnection { circuit_id: circuit_id.to_string(), cancel, task });
        info!(circuit = circuit_id, "Connected");
        true
    }

    /// Close the connection and drop all accumulated state.
    ///
    /// A connect attempt still in flight is abandoned first.
    pub async fn disconnect(&self) {
        if let Some(attempt) = self.attempt.lock().take() {
            attempt.cancel();
        }
        let mut control = self.control.lock().await;
        self.teardown(&mut control).await;
    }

    /// Connect again to the last requested circuit, from scratch.
    pub async fn reconnect(&self) -> bool {
        let circuit = self.control.lock().await.last_circuit.clone();
        match circuit {
            Some(circuit) => {
                self.disconnect().await;
                self.connect(&circuit).await
            }
            None => {
                debug!("reconnect called before any connect");
                false
            }
        }
    }

    async fn teardown(&self, control: &mut Control) {
        if let Some(active) = control.active.take() {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                warn!(error = %e, "Driver task ended abnormally");
            }
            info!(circuit = %active.circuit_id, "Disconnected");
        }
        self.shared.clear();
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver for connection state; yields the current state first.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Connection state changes as a stream, starting with the current state.
    pub fn state_updates(&self) -> BoxStream<'static, ConnectionState> {
        WatchStream::new(self.state_receiver()).boxed()
    }

    /// Why the last connection attempt or connection failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Messages dropped because no known envelope shape matched.
    pub fn malformed_messages(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    pub async fn current_circuit(&self) -> Option<String> {
        self.control.lock().await.active.as_ref().map(|active| active.circuit_id.clone())
    }

    /// Copy of every kart's accumulated snapshot.
    pub fn all_karts_data(&self) -> BTreeMap<String, KartSnapshot> {
        self.shared.karts.lock().snapshots.clone()
    }

    pub fn kart_data(&self, kart_id: &str) -> Option<KartSnapshot> {
        self.shared.karts.lock().snapshots.get(kart_id).cloned()
    }

    /// Field order announced by the feed, if any.
    pub fn column_order(&self) -> Vec<String> {
        self.shared.karts.lock().column_order.clone()
    }

    /// Every telemetry update from now on.
    ///
    /// A subscriber that falls more than `broadcast_capacity` updates behind
    /// skips the oldest ones.
    pub fn subscribe(&self) -> BoxStream<'static, Arc<TelemetryUpdate>> {
        BroadcastStream::new(self.shared.updates_tx.subscribe())
            .filter_map(|update| async move {
                match update {
                    Ok(update) => Some(update),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Telemetry subscriber lagging, updates skipped");
                        None
                    }
                }
            })
            .boxed()
    }

    /// Updates at most `rate` times per second; updates in between are merged.
    pub fn subscribe_throttled(&self, rate: UpdateRate) -> BoxStream<'static, Arc<TelemetryUpdate>> {
        match rate.throttle_interval() {
            None => self.subscribe(),
            Some(interval) => self.subscribe().throttle(interval).boxed(),
        }
    }

    /// Turn lap detection on or off.
    ///
    /// Turning it back on starts every kart afresh.
    pub fn enable_lap_detection(&self, enabled: bool) {
        let was_enabled = self.shared.detection.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled {
            if let Some(detector) = &self.shared.detector {
                detector.reset();
            }
        }
        info!(enabled, "Lap detection toggled");
    }

    pub fn lap_detection_enabled(&self) -> bool {
        self.shared.detection.load(Ordering::Acquire)
    }

    /// Current lap counter of every kart the detector has seen.
    pub fn lap_counters(&self) -> BTreeMap<String, u32> {
        self.shared.detector.as_ref().map(|detector| detector.lap_counters()).unwrap_or_default()
    }
}

impl Drop for TelemetryConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.control.get_mut().active.take() {
            debug!(circuit = %active.circuit_id, "Dropping connection manager");
            active.cancel.cancel();
        }
    }
}
