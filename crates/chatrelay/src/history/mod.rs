//! Server-side conversation history, keyed by session identifier.

mod repository;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::Message;

pub use repository::{ChatRecord, HistoryRepository};

/// Persistence for one conversation document per session.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Stored message list for `sid`, if any.
    async fn load(&self, sid: &str) -> Result<Option<Vec<Message>>>;

    /// Replace the stored list for `sid` (last write wins).
    async fn save(&self, sid: &str, messages: &[Message]) -> Result<()>;
}

/// Environment variable naming the history database file.
pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";

/// File name used under the data directory when nothing else is set.
pub const DEFAULT_DATABASE_FILE: &str = "chatrelay.db";

/// `[storage]` section of the server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file. Defaults to `<data dir>/chatrelay.db`.
    pub database_path: Option<String>,
}

impl StorageConfig {
    /// Database file to open: `DATABASE_PATH`, then `database_path`, then
    /// `<data_dir>/chatrelay.db`. `~` and `$VARS` are expanded.
    pub fn resolve(&self, data_dir: &Path) -> Result<PathBuf> {
        let from_env = std::env::var(DATABASE_PATH_ENV).ok();
        self.resolve_with(from_env.as_deref(), data_dir)
    }

    fn resolve_with(&self, from_env: Option<&str>, data_dir: &Path) -> Result<PathBuf> {
        let chosen = from_env
            .filter(|v| !v.is_empty())
            .or(self.database_path.as_deref());
        match chosen {
            Some(raw) => {
                let expanded = shellexpand::full(raw)
                    .with_context(|| format!("expanding database path {raw}"))?;
                Ok(PathBuf::from(expanded.into_owned()))
            }
            None => Ok(data_dir.join(DEFAULT_DATABASE_FILE)),
        }
    }
}
