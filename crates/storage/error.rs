use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to acquire a store lock")]
    LockError,
    #[error("{0}")]
    Custom(String),
}
