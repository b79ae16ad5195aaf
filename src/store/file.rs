//! File-per-key durable store

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::KeyValueStore;
use crate::{KartwallError, Result};

/// Durable key-value store keeping one file per key in a directory.
///
/// Keys are percent-encoded into file names, so any string is a valid key.
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    name: String,
    dir: PathBuf,
}

const EXTENSION: &str = "entry";

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| KartwallError::io_error(dir.clone(), e))?;
        let name = name.into();
        debug!(store = %name, dir = %dir.display(), "Opened file key-value store");
        Ok(Self { name, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", urlencoding::encode(key)))
    }

    fn unavailable(&self, reason: &str, source: std::io::Error) -> KartwallError {
        KartwallError::store_unavailable_with_source(self.name.clone(), reason, Box::new(source))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.unavailable("read failed", e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, value).await.map_err(|e| self.unavailable("write failed", e))?;
        tokio::fs::rename(&staging, &path).await.map_err(|e| self.unavailable("rename failed", e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.unavailable("delete failed", e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| self.unavailable("list failed", e))?;
        let mut keys = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| self.unavailable("list failed", e))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(e) => warn!(store = %self.name, file = %path.display(), error = %e, "Skipping undecodable key"),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen_and_encodes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let key = "kart_stats:C1-1000:7/odd key";

        {
            let store = FileKeyValueStore::open("l3", dir.path()).await.unwrap();
            store.put(key, b"{\"v\":1}".to_vec()).await.unwrap();
        }

        let reopened = FileKeyValueStore::open("l3", dir.path()).await.unwrap();
        assert_eq!(reopened.get(key).await.unwrap(), Some(b"{\"v\":1}".to_vec()));
        assert_eq!(reopened.keys().await.unwrap(), vec![key.to_string()]);

        reopened.delete(key).await.unwrap();
        reopened.delete(key).await.unwrap();
        assert_eq!(reopened.get(key).await.unwrap(), None);
        assert!(reopened.keys().await.unwrap().is_empty());
    }
}
