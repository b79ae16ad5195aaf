//! Exactly-once lap persistence and session lifecycle
//!
//! Laps are written under a deterministic id (`{session}_{kart}_{lap}`), so a
//! lap reported twice lands on the same document. A resubmission with the
//! same lap time is a no-op; a different time replaces the record.
//!
//! Collections in the document store:
//!
//! | Collection       | Id                     | Content          |
//! |------------------|------------------------|------------------|
//! | `sessions`       | session id             | [`Session`]      |
//! | `laps`           | lap id                 | [`Lap`]          |
//! | `kart_histories` | `{session}_{kart}`     | [`KartHistory`]  |

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::store::{Direction, DocumentStore, Query};
use crate::types::{KartHistory, Lap, NewLap, Session};
use crate::{KartwallError, Result};

pub const SESSIONS: &str = "sessions";
pub const LAPS: &str = "laps";
pub const KART_HISTORIES: &str = "kart_histories";

const LAP_BROADCAST_CAPACITY: usize = 256;

/// What [`LapStore::store_lap`] did with a lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Written (new, or replacing a record with a different time).
    Stored,
    /// Already recorded with the same time; nothing written.
    Duplicate,
}

/// Aggregate view of the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub session: Session,
    pub total_laps: u32,
    pub kart_count: usize,
    /// Sorted by kart id.
    pub karts: Vec<KartHistory>,
    pub best_lap: Option<BestLap>,
}

/// Fastest lap of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestLap {
    pub kart_id: String,
    pub lap_time: String,
    pub duration_ms: u64,
}

/// Everything recorded for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: Session,
    pub karts: Vec<KartHistory>,
    /// In recording order.
    pub laps: Vec<Lap>,
    pub exported_at: u64,
}

/// Idempotent lap store bound to one current session.
pub struct LapStore {
    documents: Arc<dyn DocumentStore>,
    clock: SharedClock,
    session: Mutex<Option<Session>>,
    /// Rollups keyed by `(session id, kart id)`.
    histories: Mutex<HashMap<(String, String), KartHistory>>,
    /// Serializes read-check-write so two submissions of one lap cannot both write.
    writes: tokio::sync::Mutex<()>,
    laps_tx: broadcast::Sender<Arc<Lap>>,
}

impl LapStore {
    pub fn new(documents: Arc<dyn DocumentStore>, clock: SharedClock) -> Self {
        let (laps_tx, _) = broadcast::channel(LAP_BROADCAST_CAPACITY);
        Self {
            documents,
            clock,
            session: Mutex::new(None),
            histories: Mutex::new(HashMap::new()),
            writes: tokio::sync::Mutex::new(()),
            laps_tx,
        }
    }

    /// The current session, active or stopped.
    pub fn current_session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn has_active_session(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.active)
    }

    fn active_session(&self) -> Result<Session> {
        self.session.lock().clone().filter(|s| s.active).ok_or(KartwallError::NoActiveSession)
    }

    fn any_session(&self) -> Result<Session> {
        self.current_session().ok_or(KartwallError::NoActiveSession)
    }

    /// Start recording a new session on `circuit_id`.
    ///
    /// A still-active previous session is stopped first. Per-kart state from
    /// the previous session is dropped; its documents are kept. A session
    /// started in the same millisecond as an existing one gets a numeric
    /// suffix so the two never share laps.
    pub async fn start_session(&self, circuit_id: &str) -> Result<Session> {
        if self.has_active_session() {
            self.stop_session().await?;
        }

        let mut session = Session::start(circuit_id, self.clock.now_ms());
        let base_id = session.id.clone();
        let mut suffix = 1;
        while self.documents.get(SESSIONS, &session.id).await?.is_some() {
            suffix += 1;
            session.id = format!("{base_id}-{suffix}");
        }
        self.documents.set(SESSIONS, &session.id, to_document("session", &session)?).await?;

        self.histories.lock().clear();
        *self.session.lock() = Some(session.clone());
        info!(session = %session.id, circuit = circuit_id, "Session started");
        Ok(session)
    }

    /// Mark the current session inactive. Returns `None` if nothing was running.
    pub async fn stop_session(&self) -> Result<Option<Session>> {
        let Ok(mut session) = self.active_session() else {
            debug!("stop_session called with no active session");
            return Ok(None);
        };
        session.active = false;
        session.ended_at = Some(self.clock.now_ms());
        self.documents.set(SESSIONS, &session.id, to_document("session", &session)?).await?;

        *self.session.lock() = Some(session.clone());
        info!(session = %session.id, "Session stopped");
        Ok(Some(session))
    }

    /// Persist a lap in the active session, exactly once.
    ///
    /// The lap document is written before the kart rollup. If the rollup
    /// write fails the error is returned, and resubmitting the lap rebuilds
    /// the rollup from the stored laps.
    pub async fn store_lap(&self, lap: NewLap) -> Result<StoreOutcome> {
        if lap.lap_number == 0 {
            return Err(KartwallError::InvalidLapNumber { kart_id: lap.kart_id, lap_number: 0 });
        }

        let _guard = self.writes.lock().await;
        let session = self.active_session()?;
        let lap = Lap::from_new(&session.id, lap, self.clock.now_ms());

        let existing: Option<Lap> = match self.documents.get(LAPS, &lap.id).await? {
            Some(doc) => Some(from_document("lap", doc)?),
            None => None,
        };
        if existing.as_ref().is_some_and(|e| e.lap_time == lap.lap_time) {
            debug!(lap = %lap.id, "Lap already recorded");
            self.repair_history(&session.id, &lap.kart_id).await?;
            return Ok(StoreOutcome::Duplicate);
        }

        self.documents.set(LAPS, &lap.id, to_document("lap", &lap)?).await?;

        let history = match existing {
            None => self.load_history(&session.id, &lap.kart_id).await.map(|mut history| {
                history.record(&lap);
                history
            }),
            Some(replaced) => {
                warn!(lap = %lap.id, old = %replaced.lap_time, new = %lap.lap_time, "Lap time corrected");
                self.rebuild_history(&session.id, &lap.kart_id).await
            }
        };
        let saved = match history {
            Ok(history) => self.save_history(&session.id, history).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            self.histories.lock().remove(&(session.id.clone(), lap.kart_id.clone()));
            warn!(lap = %lap.id, error = %e, "Lap stored but kart rollup not updated");
            return Err(e);
        }

        info!(session = %session.id, kart = %lap.kart_id, lap = lap.lap_number, time = %lap.lap_time, "Lap stored");
        let _ = self.laps_tx.send(Arc::new(lap));
        Ok(StoreOutcome::Stored)
    }

    /// Highest lap number recorded for `kart_id` in the active session.
    ///
    /// Read from the laps collection, never from the rollup.
    pub async fn recorded_lap_count(&self, kart_id: &str) -> Result<u32> {
        let session = self.active_session()?;
        let latest = self.kart_laps_in(&session.id, kart_id, Some(1)).await?;
        Ok(latest.first().map_or(0, |lap| lap.lap_number))
    }

    /// The rollup for `kart_id` in the current session.
    pub async fn kart_history(&self, kart_id: &str) -> Result<KartHistory> {
        let session = self.any_session()?;
        self.load_history(&session.id, kart_id).await
    }

    /// A kart's laps in the current session, newest first.
    pub async fn get_kart_laps(&self, kart_id: &str, limit: Option<usize>) -> Result<Vec<Lap>> {
        let session = self.any_session()?;
        self.kart_laps_in(&session.id, kart_id, limit).await
    }

    /// Run a lap query, returning typed laps.
    pub async fn query_laps(&self, query: &Query) -> Result<Vec<Lap>> {
        self.documents.query(LAPS, query).await?.into_iter().map(|doc| from_document("lap", doc.data)).collect()
    }

    /// Per-kart totals and the session's best lap.
    pub async fn get_session_statistics(&self) -> Result<SessionStatistics> {
        let session = self.any_session()?;
        let karts = self.session_histories(&session.id).await?;

        let total_laps = karts.iter().map(|k| k.lap_count).sum();
        let best_lap = karts
            .iter()
            .filter_map(|k| Some((k, k.best_ms?)))
            .min_by_key(|(_, ms)| *ms)
            .and_then(|(k, ms)| Some(BestLap { kart_id: k.kart_id.clone(), lap_time: k.best_lap.clone()?, duration_ms: ms }));

        Ok(SessionStatistics { session, total_laps, kart_count: karts.len(), karts, best_lap })
    }

    /// The current session with every kart rollup and lap.
    pub async fn export_session_data(&self) -> Result<SessionExport> {
        let session = self.any_session()?;
        let karts = self.session_histories(&session.id).await?;
        let laps = self
            .query_laps(&Query::new().where_eq("session_id", session.id.as_str()).order_by("created_at", Direction::Ascending))
            .await?;
        debug!(session = %session.id, laps = laps.len(), karts = karts.len(), "Exported session");
        Ok(SessionExport { session, karts, laps, exported_at: self.clock.now_ms() })
    }

    /// Stream of laps as they are stored.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Lap>> {
        self.laps_tx.subscribe()
    }

    async fn kart_laps_in(&self, session_id: &str, kart_id: &str, limit: Option<usize>) -> Result<Vec<Lap>> {
        let mut query = Query::new()
            .where_eq("session_id", session_id)
            .where_eq("kart_id", kart_id)
            .order_by("lap_number", Direction::Descending);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        self.query_laps(&query).await
    }

    async fn session_histories(&self, session_id: &str) -> Result<Vec<KartHistory>> {
        let query = Query::new().where_eq("session_id", session_id).order_by("kart_id", Direction::Ascending);
        self.documents
            .query(KART_HISTORIES, &query)
            .await?
            .into_iter()
            .map(|doc| from_document("kart history", doc.data))
            .collect()
    }

    async fn load_history(&self, session_id: &str, kart_id: &str) -> Result<KartHistory> {
        let key = (session_id.to_string(), kart_id.to_string());
        let cached = self.histories.lock().get(&key).cloned();
        if let Some(history) = cached {
            return Ok(history);
        }
        let history = match self.documents.get(KART_HISTORIES, &history_id(session_id, kart_id)).await? {
            Some(doc) => from_document("kart history", doc)?,
            None => KartHistory::new(kart_id),
        };
        self.histories.lock().insert(key, history.clone());
        Ok(history)
    }

    async fn rebuild_history(&self, session_id: &str, kart_id: &str) -> Result<KartHistory> {
        let laps = self.kart_laps_in(session_id, kart_id, None).await?;
        Ok(KartHistory::from_laps(kart_id, laps.iter().rev()))
    }

    /// Rewrite the rollup when it no longer matches the stored laps.
    async fn repair_history(&self, session_id: &str, kart_id: &str) -> Result<()> {
        let rebuilt = self.rebuild_history(session_id, kart_id).await?;
        if self.load_history(session_id, kart_id).await? != rebuilt {
            warn!(session = session_id, kart = kart_id, laps = rebuilt.lap_count, "Repairing stale kart rollup");
            self.histories.lock().remove(&(session_id.to_string(), kart_id.to_string()));
            self.save_history(session_id, rebuilt).await?;
        }
        Ok(())
    }

    async fn save_history(&self, session_id: &str, history: KartHistory) -> Result<()> {
        let mut doc = to_document("kart history", &history)?;
        if let Value::Object(fields) = &mut doc {
            fields.insert("session_id".to_string(), Value::from(session_id));
        }
        self.documents.set(KART_HISTORIES, &history_id(session_id, &history.kart_id), doc).await?;
        self.histories.lock().insert((session_id.to_string(), history.kart_id.clone()), history);
        Ok(())
    }
}

fn history_id(session_id: &str, kart_id: &str) -> String {
    format!("{session_id}_{kart_id}")
}

fn to_document<T: Serialize>(context: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| KartwallError::serialization(format!("encoding {context}"), e))
}

fn from_document<T: DeserializeOwned>(context: &str, doc: Value) -> Result<T> {
    serde_json::from_value(doc).map_err(|e| KartwallError::serialization(format!("decoding {context}"), e))
}
