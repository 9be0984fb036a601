use bytes::Bytes;
use caspra_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use caspra_trie::EMPTY_TRIE_HASH;
use ethereum_types::{Address, Bloom, H64, H256, U256};

use crate::constants::DEFAULT_UNCLES_HASH;
use crate::keccak;

pub type BlockNumber = u64;

/// The length of the structured extra-data prefix under the Casper consensus:
/// `randao_reveal (32) ‖ skips (32) ‖ i (32) ‖ j (32)`, followed by an opaque
/// signature tail of validation-code-defined length.
pub const CASPER_EXTRA_DATA_PREFIX: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub uncles_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub bloom: Bloom,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: H256,
    pub nonce: H64,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            uncles_hash: *DEFAULT_UNCLES_HASH,
            coinbase: Address::zero(),
            state_root: *EMPTY_TRIE_HASH,
            transactions_root: *EMPTY_TRIE_HASH,
            receipts_root: *EMPTY_TRIE_HASH,
            bloom: Bloom::zero(),
            difficulty: U256::one(),
            number: 0,
            gas_limit: crate::constants::DEFAULT_GAS_LIMIT,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
            mix_hash: H256::zero(),
            nonce: H64::zero(),
        }
    }
}

impl BlockHeader {
    /// Hash of the full RLP-encoded header, identifying the block.
    pub fn compute_block_hash(&self) -> H256 {
        keccak(self.encode_to_vec())
    }

    /// Hash the proposer commits to with its signature: the header RLP with
    /// the extra data truncated to the structured 128-byte prefix, dropping
    /// only the signature tail.
    pub fn signing_hash(&self) -> H256 {
        let mut unsigned = self.clone();
        if unsigned.extra_data.len() > CASPER_EXTRA_DATA_PREFIX {
            unsigned.extra_data = unsigned.extra_data.slice(..CASPER_EXTRA_DATA_PREFIX);
        }
        keccak(unsigned.encode_to_vec())
    }
}

impl RLPEncode for BlockHeader {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.parent_hash)
            .encode_field(&self.uncles_hash)
            .encode_field(&self.coinbase)
            .encode_field(&self.state_root)
            .encode_field(&self.transactions_root)
            .encode_field(&self.receipts_root)
            .encode_field(&self.bloom)
            .encode_field(&self.difficulty)
            .encode_field(&self.number)
            .encode_field(&self.gas_limit)
            .encode_field(&self.gas_used)
            .encode_field(&self.timestamp)
            .encode_field(&self.extra_data)
            .encode_field(&self.mix_hash)
            .encode_field(&self.nonce)
            .finish();
    }
}

impl RLPDecode for BlockHeader {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (parent_hash, decoder) = decoder.decode_field("parent_hash")?;
        let (uncles_hash, decoder) = decoder.decode_field("uncles_hash")?;
        let (coinbase, decoder) = decoder.decode_field("coinbase")?;
        let (state_root, decoder) = decoder.decode_field("state_root")?;
        let (transactions_root, decoder) = decoder.decode_field("transactions_root")?;
        let (receipts_root, decoder) = decoder.decode_field("receipts_root")?;
        let (bloom, decoder) = decoder.decode_field("bloom")?;
        let (difficulty, decoder) = decoder.decode_field("difficulty")?;
        let (number, decoder) = decoder.decode_field("number")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (gas_used, decoder) = decoder.decode_field("gas_used")?;
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        let (extra_data, decoder) = decoder.decode_field("extra_data")?;
        let (mix_hash, decoder) = decoder.decode_field("mix_hash")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        Ok((
            Self {
                parent_hash,
                uncles_hash,
                coinbase,
                state_root,
                transactions_root,
                receipts_root,
                bloom,
                difficulty,
                number,
                gas_limit,
                gas_used,
                timestamp,
                extra_data,
                mix_hash,
                nonce,
            },
            decoder.finish()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_roundtrip() {
        let header = BlockHeader {
            number: 42,
            timestamp: 1234,
            difficulty: U256::one(),
            extra_data: Bytes::from(vec![0xAB; 140]),
            ..Default::default()
        };
        let encoded = header.encode_to_vec();
        assert_eq!(BlockHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn signing_hash_ignores_signature_tail() {
        let base = BlockHeader {
            number: 7,
            extra_data: Bytes::from([vec![0x11; 128], vec![0x22; 65]].concat()),
            ..Default::default()
        };
        let mut other_sig = base.clone();
        other_sig.extra_data = Bytes::from([vec![0x11; 128], vec![0x33; 70]].concat());

        assert_eq!(base.signing_hash(), other_sig.signing_hash());
        assert_ne!(base.compute_block_hash(), other_sig.compute_block_hash());

        // Tampering with the structured prefix must change the signing hash
        let mut other_prefix = base.clone();
        other_prefix.extra_data = Bytes::from([vec![0x12; 128], vec![0x22; 65]].concat());
        assert_ne!(base.signing_hash(), other_prefix.signing_hash());
    }
}
