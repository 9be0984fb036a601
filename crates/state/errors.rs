use caspra_common::serde_utils::ParseError;
use caspra_rlp::error::RLPDecodeError;
use caspra_storage::StoreError;
use caspra_trie::TrieError;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Trie error: {0}")]
    Trie(#[from] TrieError),
    #[error("DB error: {0}")]
    Store(#[from] StoreError),
    #[error("RLP decode error: {0}")]
    RLPDecode(#[from] RLPDecodeError),
    #[error("Cannot revert to a snapshot taken before the last commit")]
    SnapshotAcrossCommit,
    #[error("Value type does not match the storage field it is written to")]
    StorageTypeMismatch,
    #[error("Storage values are limited to 32 bytes")]
    StorageValueTooLong,
    #[error("Missing preimage for secure trie path")]
    MissingPreimage,
    #[error("Invalid snapshot document: {0}")]
    InvalidSnapshot(String),
}

impl From<ParseError> for StateError {
    fn from(err: ParseError) -> Self {
        StateError::InvalidSnapshot(err.to_string())
    }
}
