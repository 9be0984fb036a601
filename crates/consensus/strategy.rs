//! The consensus strategy seam: seven capabilities a consensus engine may
//! implement, with explicit no-op defaults standing in for the ones a given
//! strategy does not use.

use std::sync::Arc;

use caspra_common::U256;
use caspra_common::types::{BlockHeader, ChainConfig, ConsensusKind, Fork};
use caspra_state::State;
use tracing::debug;

use crate::casper::CasperContract;
use crate::error::{ChainError, InvalidBlockError};
use crate::validation::ValidationRunner;

pub trait ConsensusStrategy: Send + Sync {
    /// Context-free structural checks on a header.
    fn header_check(&self, _header: &BlockHeader) -> Result<(), ChainError> {
        Ok(())
    }

    /// Full header validation against the pre-state.
    fn header_validate(&self, state: &mut State, header: &BlockHeader) -> Result<(), ChainError>;

    /// Validation of an uncle header against the including block's state.
    fn uncle_validate(&self, _state: &mut State, _uncle: &BlockHeader) -> Result<(), ChainError> {
        Ok(())
    }

    /// Loads the header's execution parameters into the state.
    fn block_setup(&self, state: &mut State, header: &BlockHeader) -> Result<(), ChainError> {
        state.block_number = header.number;
        state.timestamp = header.timestamp;
        state.block_coinbase = header.coinbase;
        state.block_difficulty = header.difficulty;
        state.gas_limit = header.gas_limit;
        state.gas_used = 0;
        state.txindex = 0;
        state.refunds = 0;
        state.bloom = Default::default();
        state.logs.clear();
        state.receipts.clear();
        state.suicides.clear();
        Ok(())
    }

    /// Runs after the last transaction, before the state root is sealed.
    fn block_pre_finalize(&self, _state: &mut State, _header: &BlockHeader) -> Result<(), ChainError> {
        Ok(())
    }

    /// Runs after the block is sealed.
    fn block_post_finalize(&self, state: &mut State, header: &BlockHeader) -> Result<(), ChainError> {
        state.add_block_header(header.clone());
        Ok(())
    }

    /// One-time state setup when the strategy's fork activates.
    fn state_initialize(&self, _state: &mut State) -> Result<(), ChainError> {
        Ok(())
    }
}

/// Proof-of-work consensus: structural checks only at this layer, the nonce
/// check itself belongs to the sealing engine.
#[derive(Debug, Default)]
pub struct PowStrategy;

impl ConsensusStrategy for PowStrategy {
    fn header_check(&self, header: &BlockHeader) -> Result<(), ChainError> {
        if header.difficulty.is_zero() {
            return Err(InvalidBlockError::InvalidHeader("difficulty must be non-zero").into());
        }
        if header.gas_used > header.gas_limit {
            return Err(InvalidBlockError::InvalidHeader("gas used above gas limit").into());
        }
        if header.extra_data.len() > 32 {
            return Err(InvalidBlockError::InvalidHeader("extra data over 32 bytes").into());
        }
        Ok(())
    }

    fn header_validate(&self, state: &mut State, header: &BlockHeader) -> Result<(), ChainError> {
        self.header_check(header)?;
        if let Some(parent) = state.prev_headers.first() {
            if header.number != parent.number + 1 {
                return Err(
                    InvalidBlockError::InvalidHeader("block number does not follow parent").into(),
                );
            }
            if header.timestamp <= parent.timestamp {
                return Err(
                    InvalidBlockError::InvalidHeader("timestamp not after parent").into(),
                );
            }
            if header.parent_hash != parent.compute_block_hash() {
                return Err(InvalidBlockError::InvalidHeader("parent hash mismatch").into());
            }
        }
        Ok(())
    }

    fn uncle_validate(&self, state: &mut State, uncle: &BlockHeader) -> Result<(), ChainError> {
        self.header_check(uncle)?;
        if uncle.number + 7 <= state.block_number {
            return Err(InvalidBlockError::InvalidHeader("uncle is too old").into());
        }
        Ok(())
    }
}

/// Casper proof-of-stake consensus: headers are validated by the validator
/// contract, which also applies rewards and epoch housekeeping.
pub struct CasperStrategy {
    runner: Arc<dyn ValidationRunner>,
}

impl CasperStrategy {
    pub fn new(runner: Arc<dyn ValidationRunner>) -> Self {
        Self { runner }
    }
}

impl ConsensusStrategy for CasperStrategy {
    fn header_check(&self, header: &BlockHeader) -> Result<(), ChainError> {
        if header.difficulty != U256::one() {
            return Err(
                InvalidBlockError::InvalidHeader("consensus headers carry difficulty 1").into(),
            );
        }
        if header.extra_data.len() < 128 {
            return Err(InvalidBlockError::InvalidHeader(
                "extra data shorter than the structured prefix",
            )
            .into());
        }
        Ok(())
    }

    fn header_validate(&self, state: &mut State, header: &BlockHeader) -> Result<(), ChainError> {
        self.header_check(header)?;
        CasperContract::new(state).verify_header(header, self.runner.as_ref())
    }

    fn state_initialize(&self, state: &mut State) -> Result<(), ChainError> {
        if !state.is_at_fork(Fork::Serenity) {
            return Ok(());
        }
        let epoch_length = state.config().epoch_length;
        let timestamp = state.timestamp;
        let mut contract = CasperContract::new(state);
        if !contract.is_initialized()? {
            contract.initialize(timestamp, epoch_length)?;
            contract.new_epoch(0)?;
            debug!("casper state initialized at the fork height");
        }
        Ok(())
    }
}

/// Picks the consensus strategy configured for the chain.
pub fn strategy_for(
    config: &ChainConfig,
    runner: Arc<dyn ValidationRunner>,
) -> Box<dyn ConsensusStrategy> {
    match config.consensus_strategy {
        ConsensusKind::Pow => Box::new(PowStrategy),
        ConsensusKind::Casper => Box::new(CasperStrategy::new(runner)),
    }
}
