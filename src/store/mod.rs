//! Storage backends consumed by the engine
//!
//! Two seams, both async traits in the same shape as the transport seam:
//!
//! - [`KeyValueStore`]: the persistent tiers (L2 embedded, L3 durable) of the
//!   cache engine. Byte values keyed by strings, plus key enumeration for
//!   prefix sweeps.
//! - [`DocumentStore`]: the remote document store holding sessions, laps and
//!   per-kart rollups. JSON documents addressed by `(collection, id)` with
//!   equality queries.
//!
//! In-memory implementations back tests and single-process use; a
//! file-per-key store gives a durable tier without an external service.

mod file;
mod memory;
mod query;

pub use file::FileKeyValueStore;
pub use memory::{MemoryDocumentStore, MemoryKeyValueStore};
pub use query::{Direction, Query, QueryCursor};

use serde_json::Value;

use crate::Result;

/// Byte-oriented key-value backend.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// A document with its id, as returned by queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// Document-oriented remote store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Create or fully replace a document.
    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<()>;

    async fn delete_batch(&self, collection: &str, ids: &[String]) -> Result<()>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>>;
}
