//! In-memory backends

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::{Document, DocumentStore, KeyValueStore, Query};
use crate::Result;

/// Key-value store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    name: String,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entries: Mutex::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// Document store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections.lock().get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.collections.lock().get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        self.collections.lock().entry(collection.to_string()).or_default().insert(id.to_string(), data);
        Ok(())
    }

    async fn delete_batch(&self, collection: &str, ids: &[String]) -> Result<()> {
        if let Some(docs) = self.collections.lock().get_mut(collection) {
            for id in ids {
                docs.remove(id);
            }
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        let documents: Vec<Document> = match self.collections.lock().get(collection) {
            Some(docs) => {
                docs.iter().map(|(id, data)| Document { id: id.clone(), data: data.clone() }).collect()
            }
            None => return Ok(Vec::new()),
        };
        Ok(query.apply(documents))
    }
}
