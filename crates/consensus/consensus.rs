pub mod casper;
pub mod error;
pub mod evm;
pub mod strategy;
pub mod validation;

pub use casper::{CASPER_ADDRESS, CasperContract, ExtraData, NO_END_EPOCH, VALIDATOR_SIZES};
pub use error::{ChainError, InvalidBlockError, InvalidTransactionError};
pub use strategy::{CasperStrategy, ConsensusStrategy, PowStrategy, strategy_for};
pub use validation::{EcdsaValidator, ValidationRunner};
