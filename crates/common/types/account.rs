use caspra_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use caspra_trie::EMPTY_TRIE_HASH;
use ethereum_types::{H256, U256};

use crate::constants::EMPTY_KECCAK_HASH;

/// The account record stored in the world-state trie.
///
/// Code bytes live in the backing KV store keyed by `code_hash`; the hash of
/// the empty string marks "no code". The state engine owns the store, an
/// `AccountState` is a pure value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl Default for AccountState {
    fn default() -> Self {
        Self::blank(0)
    }
}

impl AccountState {
    /// Creates a blank account: zero balance, a blank storage trie and empty code.
    pub fn blank(initial_nonce: u64) -> Self {
        Self {
            nonce: initial_nonce,
            balance: U256::zero(),
            storage_root: *EMPTY_TRIE_HASH,
            code_hash: *EMPTY_KECCAK_HASH,
        }
    }

    /// An account is blank under EIP-161 iff it has zero nonce, zero balance and no code.
    pub fn is_blank(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == *EMPTY_KECCAK_HASH
    }
}

impl RLPEncode for AccountState {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root)
            .encode_field(&self.code_hash)
            .finish();
    }
}

impl RLPDecode for AccountState {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (balance, decoder) = decoder.decode_field("balance")?;
        let (storage_root, decoder) = decoder.decode_field("storage_root")?;
        let (code_hash, decoder) = decoder.decode_field("code_hash")?;
        Ok((
            Self {
                nonce,
                balance,
                storage_root,
                code_hash,
            },
            decoder.finish()?,
        ))
    }
}
