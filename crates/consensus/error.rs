use caspra_rlp::error::RLPDecodeError;
use caspra_state::StateError;
use ethereum_types::U256;

/// Block-level failures: these abort block processing and bubble to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidBlockError {
    #[error("Invalid header: {0}")]
    InvalidHeader(&'static str),
    #[error("Header was not produced by the selected proposer")]
    InvalidProposer,
    #[error("Validation code rejected the header signature")]
    InvalidSignature,
    #[error("Validation code could not be executed")]
    VerificationFailed,
    #[error("Dunkle has already been included")]
    DuplicateDunkle,
}

/// Transaction-level failures: local to one transaction, the caller reverts
/// its pre-transaction snapshot and continues with the block.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTransactionError {
    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("Start gas below intrinsic cost")]
    InsufficientStartGas,
    #[error("Transaction is unsigned")]
    UnsignedTransaction,
    #[error("Block gas limit reached")]
    BlockGasLimitReached,
    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: U256, need: U256 },
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid Block: {0}")]
    InvalidBlock(#[from] InvalidBlockError),
    #[error("Invalid Transaction: {0}")]
    InvalidTransaction(#[from] InvalidTransactionError),
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("RLP decode error: {0}")]
    RLPDecode(#[from] RLPDecodeError),
    /// The contract's `require` trap: the current call frame is reverted and
    /// the reason surfaced to the caller.
    #[error("Contract trap: {0}")]
    Trap(&'static str),
}
