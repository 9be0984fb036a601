use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::api::KvStore;
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    table: HashMap<Vec<u8>, Vec<u8>>,
    refcounts: HashMap<Vec<u8>, u64>,
}

/// In-memory implementation of the [KvStore] trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refcount(&self, key: &[u8]) -> Result<u64, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockError)?;
        Ok(inner.refcounts.get(key).copied().unwrap_or_default())
    }
}

impl KvStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockError)?;
        Ok(inner.table.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockError)?;
        inner.table.insert(key, value);
        Ok(())
    }

    fn inc_refcount(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockError)?;
        *inner.refcounts.entry(key.clone()).or_default() += 1;
        inner.table.insert(key, value);
        Ok(())
    }
}
