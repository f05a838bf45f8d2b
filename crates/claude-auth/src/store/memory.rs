//! In-memory token store for tests
//!
//! Holds records in a map and supports fault injection: queued errors are
//! returned by the next operations in order, letting tests drive storage
//! failure paths without a real file system.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, StoreError, TokenStore, validate_key};
use crate::record::TokenRecord;

#[derive(Default)]
struct Inner {
    records: HashMap<String, TokenRecord>,
    faults: VecDeque<StoreError>,
}

/// Test backend with in-memory state and injectable faults.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next store operation.
    pub async fn fail_next(&self, err: StoreError) {
        self.inner.lock().await.faults.push_back(err);
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn take_fault(inner: &mut Inner) -> Result<()> {
    match inner.faults.pop_front() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        take_fault(&mut inner)?;
        Ok(inner.records.get(key).cloned())
    }

    async fn set(&self, key: &str, record: TokenRecord) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        take_fault(&mut inner)?;
        inner.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        take_fault(&mut inner)?;
        inner.records.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        take_fault(&mut inner)?;
        Ok(inner.records.keys().cloned().collect())
    }
}
