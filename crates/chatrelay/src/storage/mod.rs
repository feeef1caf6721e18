//! Storage abstraction layer.
//!
//! Key-value document storage used by the client-side local cache, with a
//! local filesystem implementation.

mod error;
mod local;
mod traits;

pub use error::{StorageError, StorageResult};
pub use local::FileStore;
pub use traits::KeyValueStore;
