//! Storage trait definitions.

use async_trait::async_trait;

use super::StorageResult;

/// Flat key-value storage for whole documents.
///
/// Values are overwritten wholesale; there is no partial update.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Read a value as string.
    async fn read_string(&self, key: &str) -> StorageResult<String> {
        let bytes = self.read(key).await?;
        String::from_utf8(bytes).map_err(|e| {
            super::StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Replace the value stored under `key`.
    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Whether `key` currently holds a value.
    async fn exists(&self, key: &str) -> StorageResult<bool>;
}
