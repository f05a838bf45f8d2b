//! OS keychain token store
//!
//! One keychain item per provider key, holding the JSON encoding of the
//! record. OS keychains cannot enumerate items portably, so a separate
//! index item tracks the set of stored keys. A process-wide mutex
//! serialises access; several platform keychain APIs misbehave when called
//! concurrently from one process. The keyring calls are blocking, so each
//! operation runs on the blocking thread pool.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::{Result, StoreError, TokenStore, validate_key};
use crate::record::TokenRecord;

/// Keychain service name all items are filed under.
const SERVICE: &str = "claude-gate";

/// Account name of the index item. Deliberately outside the provider key
/// alphabet so it can never collide with a stored credential.
const INDEX_ACCOUNT: &str = "__index__";

/// Token store backed by the OS keychain (macOS Keychain, Windows
/// Credential Manager, or the Secret Service API on Linux).
pub struct KeychainStore {
    service: String,
    guard: Arc<Mutex<()>>,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE)
    }

    /// Use a custom service name. Tests use this to keep scratch items out
    /// of the real credential namespace.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Run a keyring operation on the blocking pool under the process-wide
    /// keychain mutex.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&str) -> Result<T> + Send + 'static,
    {
        let guard = self.guard.clone();
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = guard.lock().unwrap_or_else(PoisonError::into_inner);
            op(&service)
        })
        .await
        .map_err(|e| StoreError::Io(format!("keychain task failed: {e}")))?
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entry(service: &str, account: &str) -> Result<Entry> {
    Entry::new(service, account)
        .map_err(|e| StoreError::Io(format!("keychain entry {account:?}: {e}")))
}

fn read_index(service: &str) -> Result<Vec<String>> {
    match entry(service, INDEX_ACCOUNT)?.get_password() {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| StoreError::Corrupt(format!("keychain index: {e}"))),
        Err(keyring::Error::NoEntry) => Ok(Vec::new()),
        Err(e) => Err(StoreError::Io(format!("reading keychain index: {e}"))),
    }
}

fn write_index(service: &str, keys: &[String]) -> Result<()> {
    let json = serde_json::to_string(keys)
        .map_err(|e| StoreError::Io(format!("encoding keychain index: {e}")))?;
    entry(service, INDEX_ACCOUNT)?
        .set_password(&json)
        .map_err(|e| StoreError::Io(format!("writing keychain index: {e}")))
}

#[async_trait]
impl TokenStore for KeychainStore {
    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        validate_key(key)?;
        let key = key.to_string();
        self.run(move |service| match entry(service, &key)?.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("keychain item {key:?}: {e}"))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Io(format!("reading keychain item {key:?}: {e}"))),
        })
        .await
    }

    async fn set(&self, key: &str, record: TokenRecord) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.run(move |service| {
            let json = serde_json::to_string(&record)
                .map_err(|e| StoreError::Io(format!("encoding record: {e}")))?;
            entry(service, &key)?
                .set_password(&json)
                .map_err(|e| StoreError::Io(format!("writing keychain item {key:?}: {e}")))?;

            let mut index = read_index(service)?;
            if !index.contains(&key) {
                index.push(key.clone());
                index.sort();
                write_index(service, &index)?;
            }
            debug!(key, "credential stored in keychain");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.run(move |service| {
            match entry(service, &key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "deleting keychain item {key:?}: {e}"
                    )));
                }
            }
            let mut index = read_index(service)?;
            if let Some(pos) = index.iter().position(|k| k == &key) {
                index.remove(pos);
                write_index(service, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.run(|service| read_index(service)).await
    }
}
