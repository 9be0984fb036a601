use bytes::Bytes;
use caspra_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::{Address, Bloom, BloomInput, H256};

/// A log record emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl Log {
    /// The byte strings this log contributes to the block bloom filter.
    pub fn bloomables(&self) -> Vec<Vec<u8>> {
        let mut items = vec![self.address.as_bytes().to_vec()];
        items.extend(self.topics.iter().map(|topic| topic.as_bytes().to_vec()));
        items
    }

    /// Folds this log into the given bloom filter.
    pub fn accrue_into(&self, bloom: &mut Bloom) {
        for item in self.bloomables() {
            bloom.accrue(BloomInput::Raw(&item));
        }
    }
}

/// Computes the 2048-bit bloom over a list of logs.
pub fn bloom_from_logs(logs: &[Log]) -> Bloom {
    let mut bloom = Bloom::zero();
    for log in logs {
        log.accrue_into(&mut bloom);
    }
    bloom
}

impl RLPEncode for Log {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.address)
            .encode_field(&self.topics)
            .encode_field(&self.data)
            .finish();
    }
}

impl RLPDecode for Log {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (address, decoder) = decoder.decode_field("address")?;
        let (topics, decoder) = decoder.decode_field("topics")?;
        let (data, decoder) = decoder.decode_field("data")?;
        Ok((
            Self {
                address,
                topics,
                data,
            },
            decoder.finish()?,
        ))
    }
}

/// A per-transaction receipt: intermediate state root, cumulative gas, bloom and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub state_root: H256,
    pub cumulative_gas_used: u64,
    pub bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn new(state_root: H256, cumulative_gas_used: u64, logs: Vec<Log>) -> Self {
        let bloom = bloom_from_logs(&logs);
        Self {
            state_root,
            cumulative_gas_used,
            bloom,
            logs,
        }
    }
}

impl RLPEncode for Receipt {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.state_root)
            .encode_field(&self.cumulative_gas_used)
            .encode_field(&self.bloom)
            .encode_field(&self.logs)
            .finish();
    }
}

impl RLPDecode for Receipt {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (state_root, decoder) = decoder.decode_field("state_root")?;
        let (cumulative_gas_used, decoder) = decoder.decode_field("cumulative_gas_used")?;
        let (bloom, decoder) = decoder.decode_field("bloom")?;
        let (logs, decoder) = decoder.decode_field("logs")?;
        Ok((
            Self {
                state_root,
                cumulative_gas_used,
                bloom,
                logs,
            },
            decoder.finish()?,
        ))
    }
}
