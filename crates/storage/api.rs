use crate::error::StoreError;

/// Content-addressed byte store backing the world state.
///
/// Code bytes are reference counted so that a self-destructing contract does
/// not orphan code still readable through other live references.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
    /// Stores the value and bumps its reference count.
    fn inc_refcount(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;
}
