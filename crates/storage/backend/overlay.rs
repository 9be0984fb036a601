use std::sync::Arc;

use crate::api::KvStore;
use crate::backend::in_memory::InMemoryStore;
use crate::error::StoreError;

/// Write-capturing overlay over a shared base store.
///
/// All writes land in the overlay; reads fall through to the base when the
/// overlay misses. Dropping the overlay discards its writes, which is what
/// makes ephemeral state clones safe for speculative execution.
#[derive(Clone)]
pub struct OverlayStore {
    overlay: InMemoryStore,
    base: Arc<dyn KvStore>,
}

impl OverlayStore {
    pub fn new(base: Arc<dyn KvStore>) -> Self {
        Self {
            overlay: InMemoryStore::new(),
            base,
        }
    }
}

impl KvStore for OverlayStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.overlay.get(key)? {
            Some(value) => Ok(Some(value)),
            None => self.base.get(key),
        }
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.overlay.put(key, value)
    }

    fn inc_refcount(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.overlay.inc_refcount(key, value)
    }
}
