use ethereum_types::{Address, H256};
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

lazy_static! {
    /// keccak256 of the empty string; marks an account without code.
    pub static ref EMPTY_KECCAK_HASH: H256 =
        H256::from_slice(Keccak256::digest([]).as_slice());
    /// keccak256 of the RLP encoding of an empty list.
    pub static ref DEFAULT_UNCLES_HASH: H256 =
        H256::from_slice(Keccak256::digest([0xc0u8]).as_slice());
    /// Address of the RIPEMD160 precompile, subject of the EIP-161 revert quirk.
    pub static ref RIPEMD160_ADDR: Address = Address::from_low_u64_be(3);
}

/// Default block gas limit of a fresh state.
pub const DEFAULT_GAS_LIMIT: u64 = 3_141_592;
