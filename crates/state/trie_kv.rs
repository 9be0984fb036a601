use std::sync::Arc;

use caspra_storage::KvStore;
use caspra_trie::{TrieDB, TrieError};

/// Adapter exposing the content-addressed [KvStore] as a [TrieDB], so the
/// account trie and every storage sub-trie share the same backend.
pub struct TrieKv {
    store: Arc<dyn KvStore>,
}

impl TrieKv {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

impl TrieDB for TrieKv {
    fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, TrieError> {
        self.store
            .get(&key)
            .map_err(|err| TrieError::DbError(err.to_string()))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TrieError> {
        self.store
            .put(key, value)
            .map_err(|err| TrieError::DbError(err.to_string()))
    }

    fn put_batch(&self, key_values: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), TrieError> {
        for (key, value) in key_values {
            self.put(key, value)?;
        }
        Ok(())
    }
}
