//! The validation-code sandbox: deposits carry opaque bytecode whose
//! execution decides whether a signature is valid for that validator.
//!
//! The runner is the `callblackbox` seam: code runs gas-capped with no state
//! access, over an input of `hash ‖ signature`, and answers with a 32-byte
//! word whose non-zeroness means "valid".

use caspra_common::{Address, H256, keccak};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, global::SECP256K1};

use crate::evm::EvmError;

/// Gas charged for one sandboxed signature check.
pub const ECRECOVER_GAS: u64 = 3000;

const WORD_TRUE: [u8; 32] = {
    let mut word = [0u8; 32];
    word[31] = 1;
    word
};

pub trait ValidationRunner: Send + Sync {
    /// Runs validation code over `data` inside a gas-capped sandbox with no
    /// state access, returning the code's output word.
    fn call_blackbox(&self, code: &[u8], data: &[u8], gas: u64) -> Result<Vec<u8>, EvmError>;
}

/// The provided validation-code dialect: the code is the 20-byte address of
/// the key holder, and a signature is a 65-byte recoverable ECDSA signature
/// (`r ‖ s ‖ recovery_id`) over the 32-byte input hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaValidator;

impl ValidationRunner for EcdsaValidator {
    fn call_blackbox(&self, code: &[u8], data: &[u8], gas: u64) -> Result<Vec<u8>, EvmError> {
        if gas < ECRECOVER_GAS {
            return Err(EvmError::OutOfGas);
        }
        if code.len() != 20 {
            return Err(EvmError::InvalidCode);
        }
        // hash (32) ‖ r (32) ‖ s (32) ‖ recovery id (1)
        if data.len() != 97 {
            return Ok(vec![0; 32]);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[..32]);
        let Ok(recovery_id) = RecoveryId::from_i32(data[96] as i32) else {
            return Ok(vec![0; 32]);
        };
        let Ok(signature) = RecoverableSignature::from_compact(&data[32..96], recovery_id) else {
            return Ok(vec![0; 32]);
        };
        let message = Message::from_digest(hash);
        let Ok(public_key) = SECP256K1.recover_ecdsa(&message, &signature) else {
            return Ok(vec![0; 32]);
        };
        if public_key_to_address(&public_key).as_bytes() == code {
            Ok(WORD_TRUE.to_vec())
        } else {
            Ok(vec![0; 32])
        }
    }
}

/// The address a public key signs for.
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    Address::from_slice(&keccak(&uncompressed[1..])[12..])
}

/// Validation code accepting signatures from the given key.
pub fn validation_code_for(public_key: &PublicKey) -> Vec<u8> {
    public_key_to_address(public_key).as_bytes().to_vec()
}

/// Produces the 65-byte signature tail the [EcdsaValidator] accepts.
pub fn sign_blackbox(secret_key: &SecretKey, hash: H256) -> Vec<u8> {
    let message = Message::from_digest(hash.0);
    let signature = SECP256K1.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = compact.to_vec();
    out.push(recovery_id.to_i32() as u8);
    out
}
