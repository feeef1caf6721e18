//! Conversation history repository.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::HistoryStore;
use crate::chat::Message;

/// Stored conversation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatRecord {
    pub sid: String,
    pub messages: String,
    pub updated_at: String,
}

impl ChatRecord {
    pub fn decode_messages(&self) -> Result<Vec<Message>> {
        serde_json::from_str(&self.messages)
            .with_context(|| format!("decoding stored messages for session {}", self.sid))
    }
}

/// SQLite-backed history store. One document per session identifier.
#[derive(Debug, Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the chats database at `path`, creating file and parent
    /// directories on first use, and bring the `chats` table up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening history database {}", path.display()))?;

        Self::migrated(pool).await
    }

    /// Private in-memory store. Pinned to one connection so every query
    /// sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening in-memory history database")?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("migrating chats table")?;
        Ok(Self::new(pool))
    }

    /// Wait for in-flight queries and close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetch the full row, including the update timestamp.
    pub async fn get(&self, sid: &str) -> Result<Option<ChatRecord>> {
        let record = sqlx::query_as::<_, ChatRecord>(
            r#"
            SELECT sid, messages, updated_at
            FROM chats
            WHERE sid = ?
            "#,
        )
        .bind(sid)
        .fetch_optional(&self.pool)
        .await
        .context("fetching conversation")?;

        Ok(record)
    }

    /// Insert or fully replace the conversation stored under `sid`.
    pub async fn upsert(&self, sid: &str, messages: &[Message]) -> Result<()> {
        let body = serde_json::to_string(messages).context("encoding messages")?;
        let updated_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO chats (sid, messages, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(sid) DO UPDATE SET
                messages = excluded.messages,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(sid)
        .bind(body)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("upserting conversation")?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for HistoryRepository {
    async fn load(&self, sid: &str) -> Result<Option<Vec<Message>>> {
        match self.get(sid).await? {
            Some(record) => Ok(Some(record.decode_messages()?)),
            None => Ok(None),
        }
    }

    async fn save(&self, sid: &str, messages: &[Message]) -> Result<()> {
        self.upsert(sid, messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> HistoryRepository {
        HistoryRepository::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let repo = repo().await;
        assert!(repo.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let repo = repo().await;
        let messages = vec![
            Message::welcome(),
            Message::user("what is an atom?"),
            Message::assistant("A tiny unit of matter."),
        ];

        repo.save("sid-1", &messages).await.unwrap();
        assert_eq!(repo.load("sid-1").await.unwrap(), Some(messages));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_document() {
        let repo = repo().await;
        repo.save("sid-1", &[Message::user("first"), Message::user("second")])
            .await
            .unwrap();
        repo.save("sid-1", &[Message::welcome()]).await.unwrap();

        assert_eq!(
            repo.load("sid-1").await.unwrap(),
            Some(vec![Message::welcome()])
        );
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let repo = repo().await;
        repo.save("a", &[Message::user("from a")]).await.unwrap();
        repo.save("b", &[Message::user("from b")]).await.unwrap();

        assert_eq!(
            repo.load("a").await.unwrap(),
            Some(vec![Message::user("from a")])
        );
    }

    #[tokio::test]
    async fn test_upsert_stamps_timestamp() {
        let repo = repo().await;
        repo.save("sid", &[]).await.unwrap();
        let record = repo.get("sid").await.unwrap().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&record.updated_at).is_ok());
        assert_eq!(record.decode_messages().unwrap(), Vec::<Message>::new());
    }

    #[tokio::test]
    async fn test_open_creates_file_and_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("chats.db");

        let repo = HistoryRepository::open(&path).await.unwrap();
        repo.save("sid", &[Message::user("kept")]).await.unwrap();
        repo.close().await;
        assert!(path.exists());

        let reopened = HistoryRepository::open(&path).await.unwrap();
        assert_eq!(
            reopened.load("sid").await.unwrap(),
            Some(vec![Message::user("kept")])
        );
    }
}
