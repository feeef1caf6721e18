//! Local cache of conversation, settings and session cookie.
//!
//! Mirrors state into persistent key-value storage under fixed keys. Reads
//! never fail: missing, unreadable or corrupt entries are cache misses.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::chat::{Message, Settings};
use crate::storage::{FileStore, KeyValueStore, StorageError, StorageResult};

pub const CONVERSATION_KEY: &str = "ai_chat_history_v1";
pub const SETTINGS_KEY: &str = "ai_settings_v1";
pub const SESSION_KEY: &str = "sid";

#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache").finish_non_exhaustive()
    }
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cache backed by one JSON file per key in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileStore::new(dir)))
    }

    /// Read and decode `key`; any failure is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.store.read(key).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return None,
            Err(err) => {
                debug!(key, error = %err, "local cache read failed");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(key, error = %err, "ignoring corrupt local cache entry");
                None
            }
        }
    }

    /// Overwrite `key` with the JSON encoding of `value`.
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.write(key, &bytes).await
    }

    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        self.store.remove(key).await
    }

    /// Cached conversation, only when it is a non-empty list.
    pub async fn load_conversation(&self) -> Option<Vec<Message>> {
        self.get::<Vec<Message>>(CONVERSATION_KEY)
            .await
            .filter(|messages| !messages.is_empty())
    }

    pub async fn store_conversation(&self, messages: &[Message]) -> StorageResult<()> {
        self.put(CONVERSATION_KEY, messages).await
    }

    pub async fn clear_conversation(&self) -> StorageResult<()> {
        self.remove(CONVERSATION_KEY).await
    }

    pub async fn load_settings(&self) -> Option<Settings> {
        self.get(SETTINGS_KEY).await
    }

    pub async fn store_settings(&self, settings: &Settings) -> StorageResult<()> {
        self.put(SETTINGS_KEY, settings).await
    }

    pub async fn load_session(&self) -> Option<String> {
        self.get::<String>(SESSION_KEY)
            .await
            .filter(|sid| !sid.is_empty())
    }

    pub async fn store_session(&self, sid: &str) -> StorageResult<()> {
        self.put(SESSION_KEY, sid).await
    }
}
