//! Durable credential storage
//!
//! The store is defined by its operation set; the file, keychain, and
//! in-memory backends are interchangeable behind `Arc<dyn TokenStore>`.
//! Every backend upholds the same contract: `set` followed by `get` on a
//! key returns an equal record, `delete` followed by `get` returns absent,
//! and `list` names exactly the stored keys.

pub mod file;
pub mod keychain;
pub mod memory;

pub use file::FileStore;
pub use keychain::KeychainStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::record::TokenRecord;

/// Errors from token store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage document exists but cannot be parsed. The file is left
    /// untouched so the user can back it up before re-authenticating.
    #[error("credential storage is corrupt: {0}")]
    Corrupt(String),

    /// File system or OS keychain failure.
    #[error("credential storage I/O failure: {0}")]
    Io(String),

    /// Provider key fails validation (lowercase alphanumeric, `-`, `_`,
    /// at most 64 chars).
    #[error("invalid provider key {0:?}")]
    InvalidKey(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyed storage of credential records.
///
/// `lock`/`unlock` are advisory and cross-process; backends where the
/// concept is meaningless keep the default no-op. They serialise writers
/// across proxy instances sharing one storage file and are not a substitute
/// for in-process synchronisation.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<TokenRecord>>;
    async fn set(&self, key: &str, record: TokenRecord) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;

    async fn lock(&self) -> Result<()> {
        Ok(())
    }
    async fn unlock(&self) -> Result<()> {
        Ok(())
    }
}

/// Validate a provider key: ASCII `[a-z0-9_-]+`, length 1..=64.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
