mod account;
mod block;
mod genesis;
mod receipt;

pub use account::AccountState;
pub use block::{BlockHeader, BlockNumber};
pub use genesis::{AllocAccount, ChainConfig, ConsensusKind, Fork, Genesis};
pub use receipt::{Log, Receipt, bloom_from_logs};
