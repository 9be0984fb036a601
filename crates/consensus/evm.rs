//! The seam the EVM collaborator plugs into. The interpreter itself lives
//! outside this workspace; block execution only needs the calling convention:
//! `(ext, msg, code) -> (success, gas_remaining, return_data)`.

use std::collections::HashMap;

use bytes::Bytes;
use caspra_state::{Snapshot, State, StateError};
use ethereum_types::{Address, U256};
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvmError {
    #[error("Out of gas")]
    OutOfGas,
    #[error("Validation code is malformed")]
    InvalidCode,
    #[error("Execution failed: {0}")]
    Failed(&'static str),
}

/// A message call.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Address,
    pub to: Address,
    pub code_address: Address,
    pub value: U256,
    pub gas: u64,
    pub data: Vec<u8>,
    pub transfers_value: bool,
}

/// A precompile: executed in place of code at its address.
pub type SpecialFn = fn(&mut Ext<'_>, &Message) -> (bool, u64, Vec<u8>);

/// The execution environment handed to the EVM: a view over the state engine
/// plus the transaction context and the precompile table.
pub struct Ext<'a> {
    pub state: &'a mut State,
    pub tx_origin: Address,
    pub specials: HashMap<Address, SpecialFn>,
}

impl<'a> Ext<'a> {
    pub fn new(state: &'a mut State, tx_origin: Address) -> Self {
        Self {
            state,
            tx_origin,
            specials: HashMap::new(),
        }
    }

    pub fn get_balance(&mut self, addr: Address) -> Result<U256, StateError> {
        self.state.get_balance(addr)
    }

    pub fn set_balance(&mut self, addr: Address, balance: U256) -> Result<(), StateError> {
        self.state.set_balance(addr, balance)
    }

    pub fn get_nonce(&mut self, addr: Address) -> Result<u64, StateError> {
        self.state.get_nonce(addr)
    }

    pub fn set_nonce(&mut self, addr: Address, nonce: u64) -> Result<(), StateError> {
        self.state.set_nonce(addr, nonce)
    }

    pub fn get_code(&mut self, addr: Address) -> Result<Bytes, StateError> {
        self.state.get_code(addr)
    }

    pub fn set_code(&mut self, addr: Address, code: Bytes) -> Result<(), StateError> {
        self.state.set_code(addr, code)
    }

    pub fn get_storage_data(&mut self, addr: Address, key: U256) -> Result<U256, StateError> {
        self.state.get_storage_data(addr, key)
    }

    pub fn set_storage_data(
        &mut self,
        addr: Address,
        key: U256,
        value: U256,
    ) -> Result<(), StateError> {
        self.state.set_storage_data(addr, key, value)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    pub fn revert(&mut self, snapshot: Snapshot) -> Result<(), StateError> {
        self.state.revert(snapshot)
    }

    pub fn block_number(&self) -> u64 {
        self.state.block_number
    }
}

/// The EVM calling convention.
pub trait Evm {
    fn execute(&self, ext: &mut Ext<'_>, msg: &Message, code: &[u8]) -> (bool, u64, Vec<u8>);
}

/// Applies a message: snapshot, value transfer, execution through a special
/// or the EVM, and a revert when execution reports failure.
///
/// A value-transfer shortfall is reported as success with full gas and no
/// state change; consensus depends on that exact shape.
pub fn apply_message(
    ext: &mut Ext<'_>,
    msg: &Message,
    code: &[u8],
    evm: &dyn Evm,
) -> Result<(bool, u64, Vec<u8>), StateError> {
    let snapshot = ext.state.snapshot();
    if msg.transfers_value && !ext.state.transfer_value(msg.sender, msg.to, msg.value)? {
        debug!(sender = ?msg.sender, to = ?msg.to, "message value transfer failed");
        return Ok((true, msg.gas, Vec::new()));
    }
    let special = ext.specials.get(&msg.code_address).copied();
    let (success, gas, data) = match special {
        Some(special) => special(ext, msg),
        None => evm.execute(ext, msg, code),
    };
    if !success {
        debug!("message execution failed, reverting");
        ext.state.revert(snapshot)?;
    }
    Ok((success, gas, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use caspra_common::types::{ChainConfig, ConsensusKind};
    use caspra_storage::InMemoryStore;
    use std::sync::Arc;

    struct FailingEvm;
    impl Evm for FailingEvm {
        fn execute(&self, ext: &mut Ext<'_>, msg: &Message, _code: &[u8]) -> (bool, u64, Vec<u8>) {
            // Burn some state, then fail
            let _ = ext.set_nonce(msg.to, 99);
            (false, 0, Vec::new())
        }
    }

    struct NoopEvm;
    impl Evm for NoopEvm {
        fn execute(&self, _ext: &mut Ext<'_>, msg: &Message, _code: &[u8]) -> (bool, u64, Vec<u8>) {
            (true, msg.gas, Vec::new())
        }
    }

    fn test_state() -> State {
        State::new(
            Arc::new(InMemoryStore::new()),
            ChainConfig::all_forks_at_genesis(ConsensusKind::Pow),
        )
        .unwrap()
    }

    fn msg(sender: Address, to: Address, value: U256) -> Message {
        Message {
            sender,
            to,
            code_address: to,
            value,
            gas: 100_000,
            data: Vec::new(),
            transfers_value: true,
        }
    }

    #[test]
    fn failed_execution_reverts_all_message_effects() {
        let mut state = test_state();
        let sender = Address::from_low_u64_be(1);
        let to = Address::from_low_u64_be(2);
        state.set_balance(sender, U256::from(100)).unwrap();

        let mut ext = Ext::new(&mut state, sender);
        let (success, _, _) =
            apply_message(&mut ext, &msg(sender, to, U256::from(40)), &[], &FailingEvm).unwrap();
        assert!(!success);
        assert_eq!(state.get_balance(sender).unwrap(), U256::from(100));
        assert_eq!(state.get_nonce(to).unwrap(), 0);
    }

    #[test]
    fn transfer_shortfall_is_a_successful_noop() {
        let mut state = test_state();
        let sender = Address::from_low_u64_be(1);
        let to = Address::from_low_u64_be(2);

        let mut ext = Ext::new(&mut state, sender);
        let message = msg(sender, to, U256::from(40));
        let (success, gas, data) =
            apply_message(&mut ext, &message, &[], &NoopEvm).unwrap();
        assert!(success);
        assert_eq!(gas, message.gas);
        assert!(data.is_empty());
        assert!(state.get_balance(to).unwrap().is_zero());
    }

    #[test]
    fn specials_take_precedence_over_code() {
        fn bump_nonce(ext: &mut Ext<'_>, msg: &Message) -> (bool, u64, Vec<u8>) {
            let _ = ext.set_nonce(msg.to, 7);
            (true, msg.gas, vec![1])
        }

        let mut state = test_state();
        let sender = Address::from_low_u64_be(1);
        let to = Address::from_low_u64_be(2);
        state.set_balance(sender, U256::from(100)).unwrap();

        let mut ext = Ext::new(&mut state, sender);
        ext.specials.insert(to, bump_nonce as SpecialFn);
        let (success, _, data) =
            apply_message(&mut ext, &msg(sender, to, U256::zero()), &[], &FailingEvm).unwrap();
        assert!(success);
        assert_eq!(data, vec![1]);
        assert_eq!(state.get_nonce(to).unwrap(), 7);
    }
}
