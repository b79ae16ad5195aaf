//! Paged views over recorded laps

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::store::LapStore;
use crate::Result;
use crate::pagination::{PageSource, PagedFetcher};
use crate::store::{Direction, Query, QueryCursor};
use crate::types::Lap;

/// One kart's laps in a session, by lap number.
pub struct KartLapSource {
    store: Arc<LapStore>,
    session_id: String,
    kart_id: String,
}

impl KartLapSource {
    pub fn new(store: Arc<LapStore>, session_id: impl Into<String>, kart_id: impl Into<String>) -> Self {
        Self { store, session_id: session_id.into(), kart_id: kart_id.into() }
    }
}

#[async_trait]
impl PageSource for KartLapSource {
    type Item = Lap;

    async fn fetch(&self, after: Option<&Lap>, limit: usize) -> Result<Vec<Lap>> {
        let mut query = Query::new()
            .where_eq("session_id", self.session_id.as_str())
            .where_eq("kart_id", self.kart_id.as_str())
            .order_by("lap_number", Direction::Ascending)
            .limit(limit);
        if let Some(lap) = after {
            query = query.start_after(QueryCursor { value: Value::from(lap.lap_number), id: lap.id.clone() });
        }
        self.store.query_laps(&query).await
    }
}

/// Every lap of a session, in recording order.
pub struct SessionLapSource {
    store: Arc<LapStore>,
    session_id: String,
}

impl SessionLapSource {
    pub fn new(store: Arc<LapStore>, session_id: impl Into<String>) -> Self {
        Self { store, session_id: session_id.into() }
    }
}

#[async_trait]
impl PageSource for SessionLapSource {
    type Item = Lap;

    async fn fetch(&self, after: Option<&Lap>, limit: usize) -> Result<Vec<Lap>> {
        let mut query = Query::new()
            .where_eq("session_id", self.session_id.as_str())
            .order_by("created_at", Direction::Ascending)
            .limit(limit);
        if let Some(lap) = after {
            query = query.start_after(QueryCursor { value: Value::from(lap.created_at), id: lap.id.clone() });
        }
        self.store.query_laps(&query).await
    }
}

pub type KartLapPages = PagedFetcher<KartLapSource>;
pub type SessionLapPages = PagedFetcher<SessionLapSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryDocumentStore;
    use crate::types::NewLap;

    async fn recorded_store() -> (Arc<LapStore>, String) {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), Arc::new(clock.clone())));
        let session = store.start_session("C1").await.unwrap();
        for n in 1..=12u32 {
            for kart in ["7", "9"] {
                clock.advance_ms(10);
                store.store_lap(NewLap::new(kart, n, format!("1:{:02}.000", 20 + n))).await.unwrap();
            }
        }
        (store, session.id)
    }

    #[tokio::test]
    async fn kart_pages_follow_lap_numbers() {
        let (store, session_id) = recorded_store().await;
        let pages: KartLapPages = PagedFetcher::new(KartLapSource::new(store, session_id, "7"), 5, 0);

        let mut numbers = Vec::new();
        for n in 1..=3 {
            let page = pages.get_page(n).await.unwrap();
            assert!(page.items.iter().all(|lap| lap.kart_id == "7"));
            numbers.extend(page.items.iter().map(|lap| lap.lap_number));
        }
        assert_eq!(numbers, (1..=12).collect::<Vec<_>>());
        assert!(pages.is_exhausted().await);
    }

    #[tokio::test]
    async fn session_pages_follow_recording_order() {
        let (store, session_id) = recorded_store().await;
        let pages: SessionLapPages = PagedFetcher::new(SessionLapSource::new(store, session_id), 10, 1);

        let second = pages.get_page(2).await.unwrap();
        let karts: Vec<_> = second.items.iter().map(|lap| (lap.kart_id.as_str(), lap.lap_number)).collect();
        assert_eq!(karts.first(), Some(&("7", 6)));
        assert_eq!(karts.last(), Some(&("9", 10)));
        assert_eq!(pages.get_page(3).await.unwrap().items.len(), 4);
    }
}
