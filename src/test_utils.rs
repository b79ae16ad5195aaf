//! Test utilities: scripted feeds, failing backends and frame builders
//!
//! Shared by unit tests, integration tests and benchmarks, so the engine can
//! be driven end to end without a network or a real storage service.

#![cfg(any(test, feature = "benchmark"))]

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::store::{Document, DocumentStore, KeyValueStore, MemoryDocumentStore, Query};
use crate::transport::{Transport, TransportConnection};
use crate::{KartwallError, Result};

/// What the next connect attempt does.
enum Scripted {
    Accept(mpsc::UnboundedReceiver<FeedEvent>),
    Refuse(String),
    Hang,
}

enum FeedEvent {
    Frame(String),
    Fail(String),
    Close,
}

/// Transport whose connect attempts follow a script.
///
/// Attempts beyond the script are refused.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    urls: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    attempts: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept the next attempt; the returned handle drives that connection.
    pub fn accept(&self) -> FeedHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Scripted::Accept(rx));
        FeedHandle { tx }
    }

    /// Refuse the next attempt.
    pub fn refuse(&self, reason: impl Into<String>) {
        self.script.lock().push_back(Scripted::Refuse(reason.into()));
    }

    /// Never answer the next attempt.
    pub fn hang(&self) {
        self.script.lock().push_back(Scripted::Hang);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// URLs dialed so far, in order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Frames sent by clients over any connection.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Accept(events)) => Ok(Box::new(ScriptedConnection { events, sent: self.sent.clone() })),
            Some(Scripted::Refuse(reason)) => Err(KartwallError::transport(reason)),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Err(KartwallError::transport("connection refused")),
        }
    }
}

struct ScriptedConnection {
    events: mpsc::UnboundedReceiver<FeedEvent>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl TransportConnection for ScriptedConnection {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        match self.events.recv().await {
            Some(FeedEvent::Frame(text)) => Ok(Some(text)),
            Some(FeedEvent::Fail(reason)) => Err(KartwallError::transport(reason)),
            Some(FeedEvent::Close) | None => Ok(None),
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.events.close();
    }
}

/// Server side of one scripted connection.
///
/// Dropping the handle closes the connection.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedHandle {
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.tx.send(FeedEvent::Frame(text.into()));
    }

    pub fn send_json(&self, value: &Value) {
        self.send(value.to_string());
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(FeedEvent::Fail(reason.into()));
    }

    /// Close the connection from the feed side.
    pub fn close(&self) {
        let _ = self.tx.send(FeedEvent::Close);
    }
}

/// Key-value store whose every operation fails.
pub struct FailingKeyValueStore {
    name: String,
}

impl FailingKeyValueStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn error(&self) -> KartwallError {
        KartwallError::store_unavailable(self.name.clone(), "backend offline")
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FailingKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(self.error())
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
        Err(self.error())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(self.error())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Err(self.error())
    }
}

/// In-memory document store that rejects the next `n` writes to one collection.
#[derive(Default)]
pub struct FlakyDocumentStore {
    inner: MemoryDocumentStore,
    failing: Mutex<Option<(String, usize)>>,
}

impl FlakyDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, collection: &str, times: usize) {
        *self.failing.lock() = Some((collection.to_string(), times));
    }

    pub fn count(&self, collection: &str) -> usize {
        self.inner.count(collection)
    }
}

#[async_trait::async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.inner.get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        {
            let mut failing = self.failing.lock();
            if let Some((target, remaining)) = failing.as_mut()
                && target == collection
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(KartwallError::store_unavailable("flaky-documents", format!("write to {collection} rejected")));
            }
        }
        self.inner.set(collection, id, data).await
    }

    async fn delete_batch(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.inner.delete_batch(collection, ids).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        self.inner.query(collection, query).await
    }
}

/// A `karting_data` frame with the given karts and fields.
pub fn drivers_frame(karts: &[(&str, &[(&str, &str)])]) -> Value {
    let drivers: Map<String, Value> = karts
        .iter()
        .map(|(kart, fields)| {
            let fields: Map<String, Value> = fields.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect();
            (kart.to_string(), Value::Object(fields))
        })
        .collect();
    json!({"type": "karting_data", "drivers": drivers})
}

/// A frame reporting one kart's last lap time.
pub fn last_lap_frame(kart: &str, lap_time: &str) -> Value {
    drivers_frame(&[(kart, &[("last_lap", lap_time)])])
}

/// Last-lap readings for a kart over `laps` laps, with the repeats and
/// placeholders a real feed sends in between.
pub fn noisy_lap_readings(laps: usize) -> Vec<String> {
    let mut readings = vec!["--:--".to_string()];
    for lap in 0..laps {
        let time = crate::types::LapTime::from_millis(84_000 + (lap as u64 * 373) % 2_500)
            .map(|t| t.format())
            .unwrap_or_default();
        readings.push(time.clone());
        readings.push(time);
        if lap % 3 == 0 {
            readings.push(String::new());
        }
    }
    readings
}
