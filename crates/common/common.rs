pub mod constants;
pub mod serde_utils;
pub mod types;

pub use ethereum_types::{Address, Bloom, BloomInput, H64, H256, U256};

use sha3::{Digest, Keccak256};

/// Keccak-256 convenience wrapper used across the workspace.
pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(&Keccak256::digest(data.as_ref()))
}
