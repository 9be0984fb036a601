//! End-to-end flows through the validator contract: deposits, weighted
//! proposer selection, header acceptance, dunkle inclusion and the
//! withdrawal lifecycle.

use std::sync::Arc;

use caspra_common::types::{BlockHeader, ChainConfig, ConsensusKind};
use caspra_common::{Address, H256, U256, keccak};
use caspra_consensus::casper::{CASPER_ADDRESS, CasperContract, ExtraData, NO_END_EPOCH};
use caspra_consensus::error::{ChainError, InvalidBlockError};
use caspra_consensus::strategy::{ConsensusStrategy, strategy_for};
use caspra_consensus::validation::{
    EcdsaValidator, public_key_to_address, sign_blackbox, validation_code_for,
};
use caspra_rlp::encode::RLPEncode;
use caspra_state::State;
use caspra_storage::InMemoryStore;
use secp256k1::{SecretKey, global::SECP256K1};

const EPOCH_LENGTH: u64 = 5;

fn wei(size: u64) -> U256 {
    U256::from(size) * U256::exp10(18)
}

struct Validator {
    secret: SecretKey,
    address: Address,
    code: Vec<u8>,
    randao_seed: H256,
}

impl Validator {
    fn new(byte: u8) -> Self {
        let secret = SecretKey::from_slice(&[byte; 32]).expect("static test key");
        let public = secret.public_key(&SECP256K1);
        Self {
            secret,
            address: public_key_to_address(&public),
            code: validation_code_for(&public),
            randao_seed: keccak([byte]),
        }
    }

    /// The hash-chain commitment registered at deposit time; the seed is its reveal.
    fn commitment(&self) -> H256 {
        keccak(self.randao_seed)
    }
}

fn casper_state() -> State {
    let mut config = ChainConfig::all_forks_at_genesis(ConsensusKind::Casper);
    config.epoch_length = EPOCH_LENGTH;
    let mut state = State::new(Arc::new(InMemoryStore::new()), config).unwrap();
    let mut contract = CasperContract::new(&mut state);
    contract.initialize(0, EPOCH_LENGTH).unwrap();
    assert!(contract.new_epoch(0).unwrap());
    state
}

/// Two deposits of 64 and 128 units at epoch 0, then two epoch rollovers so
/// both validators are live for selection.
fn two_validator_state() -> (State, Validator, Validator, (u64, u64), (u64, u64)) {
    let mut state = casper_state();
    let alice = Validator::new(1);
    let bob = Validator::new(2);
    state.set_balance(alice.address, wei(64)).unwrap();
    state.set_balance(bob.address, wei(128)).unwrap();

    let slot_alice = CasperContract::new(&mut state)
        .deposit(alice.address, wei(64), &alice.code, alice.commitment())
        .unwrap();
    let slot_bob = CasperContract::new(&mut state)
        .deposit(bob.address, wei(128), &bob.code, bob.commitment())
        .unwrap();

    let mut contract = CasperContract::new(&mut state);
    assert!(contract.new_epoch(5).unwrap());
    assert!(contract.new_epoch(10).unwrap());
    state.block_number = 10;
    (state, alice, bob, slot_alice, slot_bob)
}

fn build_header(
    state: &mut State,
    validator: &Validator,
    number: u64,
    skips: u64,
    bucket: u64,
    slot: u64,
    reveal: H256,
) -> BlockHeader {
    let min_timestamp = CasperContract::new(state)
        .min_timestamp(number, skips)
        .unwrap();
    let mut header = BlockHeader {
        number,
        difficulty: U256::one(),
        timestamp: min_timestamp + 1,
        extra_data: ExtraData::assemble(reveal, skips, bucket, slot, &[]),
        ..Default::default()
    };
    let signature = sign_blackbox(&validator.secret, header.signing_hash());
    header.extra_data = ExtraData::assemble(reveal, skips, bucket, slot, &signature);
    header
}

#[test]
fn deposit_assigns_buckets_and_tracks_deltas() {
    let (mut state, _, _, slot_alice, slot_bob) = two_validator_state();
    assert_eq!(slot_alice, (0, 0));
    assert_eq!(slot_bob, (1, 0));

    let mut contract = CasperContract::new(&mut state);
    assert_eq!(contract.get_epoch().unwrap(), U256::from(2u64));
    assert_eq!(contract.get_start_epoch(0, 0).unwrap(), U256::one());
    assert_eq!(contract.get_end_epoch(0, 0).unwrap(), *NO_END_EPOCH);
    // Deltas land at the validators' start epoch and roll into the totals
    assert_eq!(
        contract.get_historical_total_deposits(0).unwrap(),
        U256::zero()
    );
    assert_eq!(
        contract.get_historical_total_deposits(1).unwrap(),
        wei(64) + wei(128)
    );
    assert_eq!(contract.get_total_deposits().unwrap(), wei(64) + wei(128));
    assert_eq!(contract.get_historical_validator_count(1, 0).unwrap(), 1);
    assert_eq!(contract.get_historical_validator_count(1, 1).unwrap(), 1);
    // The deposits moved into the contract's balance
    drop(contract);
    assert_eq!(
        state.get_balance(*CASPER_ADDRESS).unwrap(),
        wei(64) + wei(128)
    );
}

#[test]
fn deposit_rejects_bad_value_and_missing_funds() {
    let mut state = casper_state();
    let validator = Validator::new(7);
    state.set_balance(validator.address, wei(64)).unwrap();

    let err = CasperContract::new(&mut state)
        .deposit(
            validator.address,
            wei(64) + U256::one(),
            &validator.code,
            validator.commitment(),
        )
        .unwrap_err();
    assert!(matches!(err, ChainError::Trap(_)));

    let err = CasperContract::new(&mut state)
        .deposit(
            validator.address,
            wei(128),
            &validator.code,
            validator.commitment(),
        )
        .unwrap_err();
    assert!(matches!(err, ChainError::InvalidTransaction(_)));
    // The failed deposits left no trace
    assert_eq!(state.get_balance(validator.address).unwrap(), wei(64));
    assert_eq!(
        CasperContract::new(&mut state).get_validator_count(0).unwrap(),
        0
    );
}

#[test]
fn new_epoch_is_idempotent_and_boundary_guarded() {
    let (mut state, ..) = two_validator_state();
    let mut contract = CasperContract::new(&mut state);
    // Replay of the last rollover and off-boundary calls are no-ops
    assert!(!contract.new_epoch(10).unwrap());
    assert!(!contract.new_epoch(20).unwrap());
    assert!(contract.new_epoch(15).unwrap());
    assert_eq!(contract.get_epoch().unwrap(), U256::from(3u64));
}

#[test]
fn proposer_selection_is_deposit_weighted() {
    let (mut state, _, _, slot_alice, slot_bob) = two_validator_state();
    let mut contract = CasperContract::new(&mut state);

    let samples = 2000u64;
    let mut bob_hits = 0u64;
    for skips in 0..samples {
        let selected = contract.get_validator(skips).unwrap();
        assert!(selected == slot_alice || selected == slot_bob);
        if selected == slot_bob {
            bob_hits += 1;
        }
    }
    // Bob holds 128 of the 192 staked units
    let expected = samples * 128 / 192;
    let tolerance = samples / 10;
    assert!(
        bob_hits.abs_diff(expected) < tolerance,
        "bucket weighting off: {bob_hits} hits of {samples}, expected around {expected}"
    );
}

#[test]
fn header_acceptance_rewards_proposer_and_advances_randao() {
    let (mut state, alice, bob, slot_alice, _) = two_validator_state();
    state.block_number = 11;

    let (bucket, slot) = CasperContract::new(&mut state).get_validator(0).unwrap();
    let proposer = if (bucket, slot) == slot_alice { &alice } else { &bob };
    let reveal = proposer.randao_seed;
    let header = build_header(&mut state, proposer, 11, 0, bucket, slot, reveal);
    state.timestamp = header.timestamp;

    let mut contract = CasperContract::new(&mut state);
    let deposit_before = contract.get_deposit(bucket, slot).unwrap();
    let reward = contract.block_reward().unwrap();
    contract.verify_header(&header, &EcdsaValidator).unwrap();

    assert_eq!(
        contract.get_deposit(bucket, slot).unwrap(),
        deposit_before + reward
    );
    // The reveal replaced the stored commitment and mixed into the beacon
    assert_eq!(contract.get_randao(bucket, slot).unwrap(), reveal);
    assert_eq!(
        contract.get_global_randao().unwrap(),
        U256::from_big_endian(reveal.as_bytes())
    );
}

#[test]
fn header_verification_rejects_tampering() {
    let (mut state, alice, bob, slot_alice, _) = two_validator_state();
    state.block_number = 11;

    let (bucket, slot) = CasperContract::new(&mut state).get_validator(0).unwrap();
    let proposer = if (bucket, slot) == slot_alice { &alice } else { &bob };
    let other = if (bucket, slot) == slot_alice { &bob } else { &alice };
    let reveal = proposer.randao_seed;
    let good = build_header(&mut state, proposer, 11, 0, bucket, slot, reveal);
    state.timestamp = good.timestamp;

    let deposit_before = CasperContract::new(&mut state)
        .get_deposit(bucket, slot)
        .unwrap();

    // Signed by the wrong key
    let forged = build_header(&mut state, other, 11, 0, bucket, slot, reveal);
    let err = CasperContract::new(&mut state)
        .verify_header(&forged, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidSignature)
    ));

    // Claiming the wrong proposer slot
    let wrong_slot = build_header(&mut state, proposer, 11, 0, bucket, slot + 1, reveal);
    let err = CasperContract::new(&mut state)
        .verify_header(&wrong_slot, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidProposer)
    ));

    // A stale reveal that does not hash to the commitment
    let bad_reveal = build_header(&mut state, proposer, 11, 0, bucket, slot, keccak(b"bogus"));
    let err = CasperContract::new(&mut state)
        .verify_header(&bad_reveal, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidHeader(_))
    ));

    // Proof-of-work difficulty
    let mut pow_difficulty = good.clone();
    pow_difficulty.difficulty = U256::from(1000);
    let err = CasperContract::new(&mut state)
        .verify_header(&pow_difficulty, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidHeader(_))
    ));

    // Below the proposer time gate
    let mut premature = good.clone();
    premature.timestamp = 0;
    let err = CasperContract::new(&mut state)
        .verify_header(&premature, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidHeader(_))
    ));

    // Every rejection reverted cleanly
    assert_eq!(
        CasperContract::new(&mut state)
            .get_deposit(bucket, slot)
            .unwrap(),
        deposit_before
    );

    // The untampered header still goes through
    CasperContract::new(&mut state)
        .verify_header(&good, &EcdsaValidator)
        .unwrap();
}

#[test]
fn dunkle_inclusion_penalizes_and_deduplicates() {
    let (mut state, alice, bob, slot_alice, _) = two_validator_state();
    state.block_number = 11;

    let (bucket, slot) = CasperContract::new(&mut state).get_validator(0).unwrap();
    let proposer = if (bucket, slot) == slot_alice { &alice } else { &bob };
    let reveal = proposer.randao_seed;
    let canonical = build_header(&mut state, proposer, 11, 0, bucket, slot, reveal);
    state.timestamp = canonical.timestamp;
    CasperContract::new(&mut state)
        .verify_header(&canonical, &EcdsaValidator)
        .unwrap();

    // A second validly-signed header at the same height
    let mut rival = canonical.clone();
    rival.coinbase = Address::from_low_u64_be(0xdead);
    let signature = sign_blackbox(&proposer.secret, rival.signing_hash());
    rival.extra_data = ExtraData::assemble(reveal, 0, bucket, slot, &signature);
    let raw_rival = rival.encode_to_vec();

    state.block_number = 12;
    state.timestamp = 1000;
    let mut contract = CasperContract::new(&mut state);
    let deposit_before = contract.get_deposit(bucket, slot).unwrap();
    let reward = contract.block_reward().unwrap();

    let hash = contract
        .include_dunkle(&raw_rival, &EcdsaValidator)
        .unwrap();
    assert_eq!(hash, keccak(&raw_rival));
    assert_eq!(
        contract.get_deposit(bucket, slot).unwrap(),
        deposit_before - (reward - U256::one())
    );
    assert!(contract.is_dunkle_included(hash).unwrap());
    assert_eq!(contract.get_total_dunkles_included().unwrap(), 1);

    // Re-inclusion is rejected and changes nothing
    let err = contract
        .include_dunkle(&raw_rival, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::DuplicateDunkle)
    ));
    assert_eq!(contract.get_total_dunkles_included().unwrap(), 1);

    // A future header cannot be a dunkle
    let mut future = rival.clone();
    future.number = 40;
    let signature = sign_blackbox(&proposer.secret, future.signing_hash());
    future.extra_data = ExtraData::assemble(reveal, 0, bucket, slot, &signature);
    let err = contract
        .include_dunkle(&future.encode_to_vec(), &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidHeader(_))
    ));
}

#[test]
fn old_dunkle_records_pay_the_cleaner() {
    let (mut state, alice, bob, slot_alice, _) = two_validator_state();
    state.block_number = 11;
    let (bucket, slot) = CasperContract::new(&mut state).get_validator(0).unwrap();
    let proposer = if (bucket, slot) == slot_alice { &alice } else { &bob };

    let mut rival = build_header(&mut state, proposer, 9, 0, bucket, slot, proposer.randao_seed);
    rival.coinbase = Address::from_low_u64_be(0xbeef);
    let signature = sign_blackbox(&proposer.secret, rival.signing_hash());
    rival.extra_data = ExtraData::assemble(proposer.randao_seed, 0, bucket, slot, &signature);
    let raw_rival = rival.encode_to_vec();

    state.timestamp = 1000;
    let hash = CasperContract::new(&mut state)
        .include_dunkle(&raw_rival, &EcdsaValidator)
        .unwrap();

    let cleaner = Address::from_low_u64_be(0xc1ea);

    // Too fresh to clean up
    let err = CasperContract::new(&mut state)
        .remove_old_dunkle_records(cleaner, &[hash])
        .unwrap_err();
    assert!(matches!(err, ChainError::Trap(_)));

    state.timestamp = 1000 + 10_000_001;
    CasperContract::new(&mut state)
        .remove_old_dunkle_records(cleaner, &[hash])
        .unwrap();
    assert!(!CasperContract::new(&mut state).is_dunkle_included(hash).unwrap());
    assert!(!state.get_balance(cleaner).unwrap().is_zero());

    // The record is gone, cleaning again fails
    let err = CasperContract::new(&mut state)
        .remove_old_dunkle_records(cleaner, &[hash])
        .unwrap_err();
    assert!(matches!(err, ChainError::Trap(_)));
}

#[test]
fn withdrawal_lifecycle_frees_the_slot() {
    let (mut state, alice, _, (bucket, slot), _) = two_validator_state();
    let mut contract = CasperContract::new(&mut state);
    assert!(contract.new_epoch(15).unwrap());
    assert_eq!(contract.get_epoch().unwrap(), U256::from(3u64));

    let withdrawal_message = keccak(b"withdrawwithdrawwithdrawwithdraw");
    let signature = sign_blackbox(&alice.secret, withdrawal_message);
    contract
        .start_withdrawal(bucket, slot, &signature, &EcdsaValidator)
        .unwrap();
    assert_eq!(contract.get_end_epoch(bucket, slot).unwrap(), U256::from(5u64));

    // Replaying does not move the exit epoch again
    contract
        .start_withdrawal(bucket, slot, &signature, &EcdsaValidator)
        .unwrap();
    assert_eq!(contract.get_end_epoch(bucket, slot).unwrap(), U256::from(5u64));

    // The exiting deposit leaves the totals at its end epoch
    assert!(contract.new_epoch(20).unwrap());
    assert!(contract.new_epoch(25).unwrap());
    assert_eq!(contract.get_total_deposits().unwrap(), wei(128));
    assert_eq!(contract.get_historical_total_deposits(5).unwrap(), wei(128));

    // Before the lock expires the withdrawal is a no-op
    let deposit = contract.get_deposit(bucket, slot).unwrap();
    assert!(!contract.withdraw(bucket, slot).unwrap());
    assert_eq!(contract.get_deposit(bucket, slot).unwrap(), deposit);

    drop(contract);
    state.timestamp = 200;
    let mut contract = CasperContract::new(&mut state);
    assert!(contract.withdraw(bucket, slot).unwrap());
    assert!(contract.get_deposit(bucket, slot).unwrap().is_zero());
    drop(contract);
    assert_eq!(state.get_balance(alice.address).unwrap(), wei(64));

    // The next matching deposit reuses the vacated slot
    let carol = Validator::new(3);
    state.set_balance(carol.address, wei(64)).unwrap();
    let reused = CasperContract::new(&mut state)
        .deposit(carol.address, wei(64), &carol.code, carol.commitment())
        .unwrap();
    assert_eq!(reused, (bucket, slot));
}

#[test]
fn invalid_signature_rejects_withdrawal_start() {
    let (mut state, _, bob, (bucket, slot), _) = two_validator_state();
    let withdrawal_message = keccak(b"withdrawwithdrawwithdrawwithdraw");
    // Bob cannot start alice's withdrawal
    let signature = sign_blackbox(&bob.secret, withdrawal_message);
    let err = CasperContract::new(&mut state)
        .start_withdrawal(bucket, slot, &signature, &EcdsaValidator)
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidBlock(InvalidBlockError::InvalidSignature)
    ));
    assert_eq!(
        CasperContract::new(&mut state).get_end_epoch(bucket, slot).unwrap(),
        *NO_END_EPOCH
    );
}

#[test]
fn casper_strategy_initializes_and_validates() {
    let mut config = ChainConfig::all_forks_at_genesis(ConsensusKind::Casper);
    config.epoch_length = EPOCH_LENGTH;
    let mut state = State::new(Arc::new(InMemoryStore::new()), config).unwrap();

    let strategy = strategy_for(&config, Arc::new(EcdsaValidator));
    strategy.state_initialize(&mut state).unwrap();
    assert!(CasperContract::new(&mut state).is_initialized().unwrap());
    assert_eq!(
        CasperContract::new(&mut state).get_epoch().unwrap(),
        U256::zero()
    );

    // Re-running the initializer is a no-op
    strategy.state_initialize(&mut state).unwrap();
    assert_eq!(
        CasperContract::new(&mut state).get_epoch().unwrap(),
        U256::zero()
    );

    // With validators registered, a signed header passes end to end
    let validator = Validator::new(9);
    state.set_balance(validator.address, wei(64)).unwrap();
    CasperContract::new(&mut state)
        .deposit(validator.address, wei(64), &validator.code, validator.commitment())
        .unwrap();
    let mut contract = CasperContract::new(&mut state);
    assert!(contract.new_epoch(5).unwrap());
    assert!(contract.new_epoch(10).unwrap());
    state.block_number = 11;

    let (bucket, slot) = CasperContract::new(&mut state).get_validator(0).unwrap();
    let header = build_header(
        &mut state,
        &validator,
        11,
        0,
        bucket,
        slot,
        validator.randao_seed,
    );
    state.timestamp = header.timestamp;
    strategy.header_validate(&mut state, &header).unwrap();
}
