use std::collections::BTreeMap;

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

/// The consensus strategies the engine can run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    Pow,
    Casper,
}

/// Named protocol forks, each activated at a per-network block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fork {
    Homestead,
    Dao,
    AntiDos,
    SpuriousDragon,
    Metropolis,
    Serenity,
}

/// Per-network chain configuration.
///
/// Serialized field names follow the upstream config table
/// (`HOMESTEAD_FORK_BLKNUM`, `ACCOUNT_INITIAL_NONCE`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ChainConfig {
    pub consensus_strategy: ConsensusKind,

    pub homestead_fork_blknum: u64,
    pub dao_fork_blknum: u64,
    pub anti_dos_fork_blknum: u64,
    pub spurious_dragon_fork_blknum: u64,
    pub metropolis_fork_blknum: u64,
    pub serenity_fork_blknum: u64,

    pub account_initial_nonce: u64,
    pub contract_code_size_limit: usize,
    pub metropolis_blockhash_store: Address,
    pub metropolis_wraparound: u64,
    pub prev_header_depth: usize,
    /// Blocks per validator epoch under the Casper strategy.
    pub epoch_length: u64,
}

/// Forks that never activate sit at a block number no chain reaches.
pub const NEVER: u64 = u64::MAX;

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            consensus_strategy: ConsensusKind::Pow,
            homestead_fork_blknum: 1_150_000,
            dao_fork_blknum: 1_920_000,
            anti_dos_fork_blknum: 2_457_000,
            spurious_dragon_fork_blknum: 2_675_000,
            metropolis_fork_blknum: NEVER,
            serenity_fork_blknum: NEVER,
            account_initial_nonce: 0,
            contract_code_size_limit: 0x6000,
            metropolis_blockhash_store: Address::from_low_u64_be(0x10),
            metropolis_wraparound: 65536,
            prev_header_depth: 256,
            epoch_length: 100,
        }
    }
}

impl ChainConfig {
    /// Configuration with every fork active from genesis, used by tests and
    /// fresh casper networks.
    pub fn all_forks_at_genesis(consensus_strategy: ConsensusKind) -> Self {
        Self {
            consensus_strategy,
            homestead_fork_blknum: 0,
            dao_fork_blknum: 0,
            anti_dos_fork_blknum: 0,
            spurious_dragon_fork_blknum: 0,
            metropolis_fork_blknum: 0,
            serenity_fork_blknum: 0,
            ..Default::default()
        }
    }

    pub fn fork_block(&self, fork: Fork) -> u64 {
        match fork {
            Fork::Homestead => self.homestead_fork_blknum,
            Fork::Dao => self.dao_fork_blknum,
            Fork::AntiDos => self.anti_dos_fork_blknum,
            Fork::SpuriousDragon => self.spurious_dragon_fork_blknum,
            Fork::Metropolis => self.metropolis_fork_blknum,
            Fork::Serenity => self.serenity_fork_blknum,
        }
    }

    /// True once the fork is active at the given block number.
    pub fn is_fork_active(&self, fork: Fork, block_number: u64) -> bool {
        block_number >= self.fork_block(fork)
    }

    /// True only at the exact fork activation height.
    pub fn is_at_fork_height(&self, fork: Fork, block_number: u64) -> bool {
        block_number == self.fork_block(fork)
    }
}

/// A pre-allocated account in a genesis or snapshot document. Numeric fields
/// accept decimal or 0x-hex strings, byte fields 0x-hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wei: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<String, String>,
}

/// A genesis document: chain configuration plus the initial allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(default)]
    pub config: ChainConfig,
    pub alloc: BTreeMap<String, AllocAccount>,
    #[serde(default)]
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_predicates() {
        let config = ChainConfig::default();
        assert!(config.is_fork_active(Fork::Homestead, 1_150_000));
        assert!(!config.is_fork_active(Fork::Homestead, 1_149_999));
        assert!(config.is_at_fork_height(Fork::Homestead, 1_150_000));
        assert!(!config.is_at_fork_height(Fork::Homestead, 1_150_001));
        assert!(!config.is_fork_active(Fork::Serenity, u64::MAX - 1));
    }

    #[test]
    fn deserialize_genesis_document() {
        let raw = r#"{
            "config": {
                "CONSENSUS_STRATEGY": "casper",
                "SERENITY_FORK_BLKNUM": 0,
                "EPOCH_LENGTH": 5
            },
            "alloc": {
                "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa": {
                    "balance": "1000000000000000000",
                    "nonce": "0"
                }
            }
        }"#;
        let genesis: Genesis = serde_json::from_str(raw).unwrap();
        assert_eq!(genesis.config.consensus_strategy, ConsensusKind::Casper);
        assert_eq!(genesis.config.serenity_fork_blknum, 0);
        assert_eq!(genesis.config.epoch_length, 5);
        assert_eq!(genesis.alloc.len(), 1);
    }
}
