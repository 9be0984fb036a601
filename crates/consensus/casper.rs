//! The validator-set and block-proposer contract. All of its durable state
//! lives in the contract account's storage slots and every transition goes
//! through the state engine's transactional interface, so header processing,
//! dunkle inclusion and withdrawals revert cleanly with the enclosing frame.

use bytes::Bytes;
use caspra_common::types::{BlockHeader, Log};
use caspra_common::{Address, H256, U256, keccak};
use caspra_rlp::decode::RLPDecode;
use caspra_state::State;
use ethereum_types::BigEndianHash;
use lazy_static::lazy_static;
use tracing::{debug, info};

use crate::error::{ChainError, InvalidBlockError, InvalidTransactionError};
use crate::validation::ValidationRunner;

/// Deposit bucket sizes, in whole units; the wei value is `size * 10^18`.
pub const VALIDATOR_SIZES: [u64; 12] = [
    64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072,
];

/// Block-making reward in parts-per-billion of the deposit base per block.
/// 1 ppb per block is roughly 1.05% annual interest at 3 second blocks.
pub const BLOCK_MAKING_PPB: u64 = 10;

/// Gas budget for one sandboxed validation-code run.
pub const VALIDATION_GAS: u64 = 500_000;

/// Dunkle records may be cleaned up once they are this many seconds old.
pub const DUNKLE_CLEANUP_AGE: u64 = 10_000_000;

/// Bound on the proposer-selection retry loop.
const SELECTION_RETRY_LIMIT: usize = 1024;

lazy_static! {
    /// The contract's account address.
    pub static ref CASPER_ADDRESS: Address = Address::from_low_u64_be(0xff);
    /// `end_epoch` sentinel meaning "active indefinitely".
    pub static ref NO_END_EPOCH: U256 = U256::one() << 99;
    /// Fixed reward unit backing the dunkle-cleanup bounty.
    pub static ref FIXED_BLOCK_REWARD: U256 = U256::exp10(17);
    static ref NEW_VALIDATOR_TOPIC: H256 = keccak(b"NewValidator(uint256,uint256)");
    static ref DUNKLE_ADDED_TOPIC: H256 = keccak(b"DunkleAdded(bytes32)");
}

// Scalar storage slots
const SLOT_TOTAL_DEPOSITS: u64 = 0;
const SLOT_RANDAO: u64 = 1;
const SLOT_GENESIS_TIMESTAMP: u64 = 2;
const SLOT_TOTAL_SKIPS: u64 = 3;
const SLOT_TOTAL_DUNKLES: u64 = 4;
const SLOT_CURRENT_EPOCH: u64 = 5;
const SLOT_INITIALIZED: u64 = 6;
const SLOT_EPOCH_LENGTH: u64 = 7;

// Per-validator fields
const FIELD_ADDRESS: u64 = 0;
const FIELD_START_EPOCH: u64 = 1;
const FIELD_END_EPOCH: u64 = 2;
const FIELD_DEPOSIT: u64 = 3;
const FIELD_RANDAO: u64 = 4;
const FIELD_LOCK_DURATION: u64 = 5;
const FIELD_ACTIVE: u64 = 6;

/// Storage slot of a mapping entry: `keccak(tag ‖ index…)`.
fn map_slot(tag: &[u8], indices: &[U256]) -> U256 {
    let mut data = tag.to_vec();
    for index in indices {
        data.extend_from_slice(&index.to_big_endian());
    }
    U256::from_big_endian(keccak(data).as_bytes())
}

fn hash_slot(tag: &[u8], hash: H256) -> U256 {
    let mut data = tag.to_vec();
    data.extend_from_slice(hash.as_bytes());
    U256::from_big_endian(keccak(data).as_bytes())
}

fn vfield(bucket: U256, slot: U256, field: u64) -> U256 {
    map_slot(b"validator", &[bucket, slot, U256::from(field)])
}

/// Deposit value of a bucket size, in wei.
fn wei(size: u64) -> U256 {
    U256::from(size) * U256::exp10(18)
}

fn require(condition: bool, err: ChainError) -> Result<(), ChainError> {
    if condition { Ok(()) } else { Err(err) }
}

/// The structured 128-byte extra-data prefix plus the signature tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraData {
    pub randao_reveal: H256,
    pub skips: u64,
    pub bucket: u64,
    pub slot: u64,
    pub signature: Vec<u8>,
}

impl ExtraData {
    pub fn parse(extra: &[u8]) -> Result<Self, ChainError> {
        if extra.len() < 128 {
            return Err(InvalidBlockError::InvalidHeader(
                "extra data shorter than the structured prefix",
            )
            .into());
        }
        let word = |range: std::ops::Range<usize>| U256::from_big_endian(&extra[range]);
        let small = |value: U256, what: &'static str| -> Result<u64, ChainError> {
            if value > U256::from(u64::MAX) {
                Err(InvalidBlockError::InvalidHeader(what).into())
            } else {
                Ok(value.as_u64())
            }
        };
        Ok(Self {
            randao_reveal: H256::from_slice(&extra[0..32]),
            skips: small(word(32..64), "skip count out of range")?,
            bucket: small(word(64..96), "bucket index out of range")?,
            slot: small(word(96..128), "slot index out of range")?,
            signature: extra[128..].to_vec(),
        })
    }

    /// Builds the extra-data field from its parts.
    pub fn assemble(randao_reveal: H256, skips: u64, bucket: u64, slot: u64, signature: &[u8]) -> Bytes {
        let mut extra = Vec::with_capacity(128 + signature.len());
        extra.extend_from_slice(randao_reveal.as_bytes());
        extra.extend_from_slice(&U256::from(skips).to_big_endian());
        extra.extend_from_slice(&U256::from(bucket).to_big_endian());
        extra.extend_from_slice(&U256::from(slot).to_big_endian());
        extra.extend_from_slice(signature);
        Bytes::from(extra)
    }
}

/// Typed facade over the contract's storage.
pub struct CasperContract<'a> {
    state: &'a mut State,
}

impl<'a> CasperContract<'a> {
    pub fn new(state: &'a mut State) -> Self {
        Self { state }
    }

    // require-trap frame: failures revert everything the entry point touched
    fn with_frame<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let snapshot = self.state.snapshot();
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.state.revert(snapshot).map_err(ChainError::State)?;
                Err(err)
            }
        }
    }

    fn sload(&mut self, slot: U256) -> Result<U256, ChainError> {
        Ok(self.state.get_storage_data(*CASPER_ADDRESS, slot)?)
    }

    fn sstore(&mut self, slot: U256, value: U256) -> Result<(), ChainError> {
        Ok(self.state.set_storage_data(*CASPER_ADDRESS, slot, value)?)
    }

    fn scalar(&mut self, slot: u64) -> Result<U256, ChainError> {
        self.sload(U256::from(slot))
    }

    fn set_scalar(&mut self, slot: u64, value: U256) -> Result<(), ChainError> {
        self.sstore(U256::from(slot), value)
    }

    /// One-shot setup of the epoch schedule; the epoch counter starts at -1
    /// so the genesis `new_epoch` advances it to zero.
    pub fn initialize(&mut self, timestamp: u64, epoch_length: u64) -> Result<(), ChainError> {
        self.with_frame(|c| {
            require(
                c.scalar(SLOT_INITIALIZED)?.is_zero(),
                ChainError::Trap("contract is already initialized"),
            )?;
            require(
                epoch_length > 0,
                ChainError::Trap("epoch length must be positive"),
            )?;
            c.set_scalar(SLOT_INITIALIZED, U256::one())?;
            c.set_scalar(SLOT_GENESIS_TIMESTAMP, U256::from(timestamp))?;
            c.set_scalar(SLOT_EPOCH_LENGTH, U256::from(epoch_length))?;
            c.set_scalar(SLOT_CURRENT_EPOCH, U256::MAX)?;
            info!(epoch_length, "validator contract initialized");
            Ok(())
        })
    }

    pub fn is_initialized(&mut self) -> Result<bool, ChainError> {
        Ok(!self.scalar(SLOT_INITIALIZED)?.is_zero())
    }

    /// Registers a validator. The attached value must match one of the fixed
    /// bucket sizes exactly; the validator becomes live at the next epoch.
    pub fn deposit(
        &mut self,
        sender: Address,
        value: U256,
        validation_code: &[u8],
        randao_commitment: H256,
    ) -> Result<(u64, u64), ChainError> {
        self.with_frame(|c| {
            let bucket = VALIDATOR_SIZES
                .iter()
                .position(|size| value == wei(*size))
                .ok_or(ChainError::Trap("deposit does not match any bucket size"))?;
            let have = c.state.get_balance(sender)?;
            require(
                c.state.transfer_value(sender, *CASPER_ADDRESS, value)?,
                InvalidTransactionError::InsufficientBalance { have, need: value }.into(),
            )?;

            let bucket_ix = U256::from(bucket as u64);
            let queue_len_slot = map_slot(b"slotq-len", &[bucket_ix]);
            let queue_len = c.sload(queue_len_slot)?;
            let slot = if !queue_len.is_zero() {
                // Reuse a vacated slot before growing the bucket
                let top = c.sload(map_slot(b"slotq", &[bucket_ix, queue_len - 1]))?;
                c.sstore(queue_len_slot, queue_len - 1)?;
                top
            } else {
                let count_slot = map_slot(b"vcount", &[bucket_ix]);
                let count = c.sload(count_slot)?;
                c.sstore(count_slot, count + 1)?;
                count
            };

            c.store_validation_code(bucket_ix, slot, validation_code)?;
            let current_epoch = c.scalar(SLOT_CURRENT_EPOCH)?;
            let start_epoch = current_epoch.overflowing_add(U256::one()).0;
            let lock_duration = c.lock_duration()?;
            c.sstore(
                vfield(bucket_ix, slot, FIELD_ADDRESS),
                U256::from_big_endian(sender.as_bytes()),
            )?;
            c.sstore(vfield(bucket_ix, slot, FIELD_START_EPOCH), start_epoch)?;
            c.sstore(vfield(bucket_ix, slot, FIELD_END_EPOCH), *NO_END_EPOCH)?;
            c.sstore(vfield(bucket_ix, slot, FIELD_DEPOSIT), value)?;
            c.sstore(
                vfield(bucket_ix, slot, FIELD_RANDAO),
                randao_commitment.into_uint(),
            )?;
            c.sstore(
                vfield(bucket_ix, slot, FIELD_LOCK_DURATION),
                U256::from(lock_duration),
            )?;
            c.sstore(vfield(bucket_ix, slot, FIELD_ACTIVE), U256::one())?;

            let delta_slot = map_slot(b"delta", &[start_epoch]);
            let delta = c.sload(delta_slot)?;
            c.sstore(delta_slot, delta.overflowing_add(value).0)?;

            c.log_new_validator(bucket_ix, slot);
            info!(bucket, slot = slot.as_u64(), "validator deposit accepted");
            Ok((bucket as u64, slot.as_u64()))
        })
    }

    /// Epoch-boundary housekeeping. Runs exactly once per epoch: replaying
    /// the call (or calling it off-boundary) is a no-op returning false.
    pub fn new_epoch(&mut self, block_number: u64) -> Result<bool, ChainError> {
        self.with_frame(|c| {
            let epoch_length = c.scalar(SLOT_EPOCH_LENGTH)?;
            require(
                !epoch_length.is_zero(),
                ChainError::Trap("contract is not initialized"),
            )?;
            let target = U256::from(block_number / epoch_length.as_u64());
            let current = c.scalar(SLOT_CURRENT_EPOCH)?;
            if current.overflowing_add(U256::one()).0 != target {
                return Ok(false);
            }
            for bucket in 0..VALIDATOR_SIZES.len() as u64 {
                let count = c.sload(map_slot(b"vcount", &[U256::from(bucket)]))?;
                c.sstore(map_slot(b"hist-count", &[target, U256::from(bucket)]), count)?;
            }
            let delta = c.sload(map_slot(b"delta", &[target]))?;
            let total = c
                .scalar(SLOT_TOTAL_DEPOSITS)?
                .overflowing_add(delta)
                .0;
            c.set_scalar(SLOT_TOTAL_DEPOSITS, total)?;
            c.sstore(map_slot(b"hist-total", &[target]), total)?;
            c.set_scalar(SLOT_CURRENT_EPOCH, target)?;
            debug!(epoch = %target, total = %total, "epoch rolled over");
            Ok(true)
        })
    }

    /// Deposit-weighted pseudorandom proposer selection for the current slot.
    ///
    /// When the sampled validator is not live at the sampling epoch the index
    /// is rehashed (`x <- keccak(x) mod total`) and the walk repeats.
    pub fn get_validator(&mut self, skips: u64) -> Result<(u64, u64), ChainError> {
        let current = self.scalar(SLOT_CURRENT_EPOCH)?;
        let epoch = if current == U256::MAX {
            U256::zero()
        } else {
            current.saturating_sub(U256::one())
        };
        let total = self.sload(map_slot(b"hist-total", &[epoch]))?;
        require(
            !total.is_zero(),
            ChainError::Trap("no validator deposits recorded for the epoch"),
        )?;
        let seed = self
            .scalar(SLOT_RANDAO)?
            .overflowing_add(U256::from(skips))
            .0;
        let mut x = U256::from_big_endian(keccak(seed.to_big_endian()).as_bytes()) % total;
        for _ in 0..SELECTION_RETRY_LIMIT {
            let (bucket, slot) = self.locate_deposit(epoch, x)?;
            let start = self.sload(vfield(bucket, slot, FIELD_START_EPOCH))?;
            let end = self.sload(vfield(bucket, slot, FIELD_END_EPOCH))?;
            if start <= epoch && epoch < end {
                return Ok((bucket.as_u64(), slot.as_u64()));
            }
            x = U256::from_big_endian(keccak(x.to_big_endian()).as_bytes()) % total;
        }
        Err(ChainError::Trap("proposer selection did not converge"))
    }

    /// Walks the buckets in order, landing on the validator whose deposit
    /// range contains `x`.
    fn locate_deposit(&mut self, epoch: U256, mut x: U256) -> Result<(U256, U256), ChainError> {
        for (bucket, size) in VALIDATOR_SIZES.iter().enumerate() {
            let bucket_ix = U256::from(bucket as u64);
            let count = self.sload(map_slot(b"hist-count", &[epoch, bucket_ix]))?;
            let weight = count * wei(*size);
            if x < weight {
                return Ok((bucket_ix, x / wei(*size)));
            }
            x = x - weight;
        }
        Err(ChainError::Trap("selection index beyond total deposit weight"))
    }

    /// A block with `skips` skipped slots is valid no earlier than this.
    pub fn min_timestamp(&mut self, block_number: u64, skips: u64) -> Result<u64, ChainError> {
        let genesis = self.scalar(SLOT_GENESIS_TIMESTAMP)?.as_u64();
        let total_skips = self.scalar(SLOT_TOTAL_SKIPS)?.as_u64();
        Ok(genesis + 3 * block_number + 6 * (total_skips + skips))
    }

    /// `max(total_deposits, 10^6 * 10^18) * BLOCK_MAKING_PPB / 10^9`
    pub fn block_reward(&mut self) -> Result<U256, ChainError> {
        let total = self.scalar(SLOT_TOTAL_DEPOSITS)?;
        let base = total.max(U256::exp10(24));
        Ok(base * U256::from(BLOCK_MAKING_PPB) / U256::from(1_000_000_000u64))
    }

    /// Withdrawal lock: `clamp(total_deposits / 2*10^18, 2*epoch_length, 10^7)` seconds.
    pub fn lock_duration(&mut self) -> Result<u64, ChainError> {
        let total = self.scalar(SLOT_TOTAL_DEPOSITS)?;
        let epoch_length = self.scalar(SLOT_EPOCH_LENGTH)?.as_u64();
        let scaled = (total / U256::exp10(18) / U256::from(2u64)).min(U256::from(10_000_000u64));
        Ok(scaled.as_u64().max(epoch_length * 2))
    }

    /// Verifies a consensus block header and applies its effects: RANDAO
    /// advance, proposer reward, skip accounting and epoch housekeeping.
    pub fn verify_header(
        &mut self,
        header: &BlockHeader,
        runner: &dyn ValidationRunner,
    ) -> Result<(), ChainError> {
        self.with_frame(|c| {
            let extra = ExtraData::parse(&header.extra_data)?;
            require(
                header.timestamp >= c.min_timestamp(header.number, extra.skips)?,
                InvalidBlockError::InvalidHeader("timestamp below the proposer time gate").into(),
            )?;
            require(
                header.difficulty == U256::one(),
                InvalidBlockError::InvalidHeader("consensus headers carry difficulty 1").into(),
            )?;
            let (bucket, slot) = c.get_validator(extra.skips)?;
            require(
                (bucket, slot) == (extra.bucket, extra.slot),
                InvalidBlockError::InvalidProposer.into(),
            )?;
            let bucket_ix = U256::from(bucket);
            let slot_ix = U256::from(slot);
            let stored_commitment = c.sload(vfield(bucket_ix, slot_ix, FIELD_RANDAO))?;
            require(
                keccak(extra.randao_reveal).into_uint() == stored_commitment,
                InvalidBlockError::InvalidHeader("randao reveal does not match the commitment")
                    .into(),
            )?;
            let code = c.validation_code(bucket, slot)?;
            require(!code.is_empty(), InvalidBlockError::InvalidProposer.into())?;
            let mut input = header.signing_hash().as_bytes().to_vec();
            input.extend_from_slice(&extra.signature);
            let out = runner
                .call_blackbox(&code, &input, VALIDATION_GAS)
                .map_err(|_| ChainError::from(InvalidBlockError::VerificationFailed))?;
            require(
                out.iter().any(|byte| *byte != 0),
                InvalidBlockError::InvalidSignature.into(),
            )?;

            // The reveal becomes the next commitment and advances the beacon
            let reveal = extra.randao_reveal.into_uint();
            c.sstore(vfield(bucket_ix, slot_ix, FIELD_RANDAO), reveal)?;
            let randao = c.scalar(SLOT_RANDAO)?;
            c.set_scalar(SLOT_RANDAO, randao.overflowing_add(reveal).0)?;
            let reward = c.block_reward()?;
            let deposit_slot = vfield(bucket_ix, slot_ix, FIELD_DEPOSIT);
            let deposit = c.sload(deposit_slot)?;
            c.sstore(deposit_slot, deposit.overflowing_add(reward).0)?;
            let total_skips = c.scalar(SLOT_TOTAL_SKIPS)?;
            c.set_scalar(SLOT_TOTAL_SKIPS, total_skips + U256::from(extra.skips))?;

            let epoch_length = c.scalar(SLOT_EPOCH_LENGTH)?.as_u64();
            if header.number % epoch_length == 0 {
                c.new_epoch(header.number)?;
            }
            debug!(number = header.number, bucket, slot, "consensus header accepted");
            Ok(())
        })
    }

    /// Records a validly-signed, non-canonical header and penalises its
    /// signer by a block reward (minus one wei).
    pub fn include_dunkle(
        &mut self,
        raw_header: &[u8],
        runner: &dyn ValidationRunner,
    ) -> Result<H256, ChainError> {
        self.with_frame(|c| {
            require(
                raw_header.len() < 2048,
                InvalidBlockError::InvalidHeader("dunkle header too large").into(),
            )?;
            let header = BlockHeader::decode(raw_header)?;
            let extra = ExtraData::parse(&header.extra_data)?;
            let code = c.validation_code(extra.bucket, extra.slot)?;
            require(!code.is_empty(), InvalidBlockError::InvalidProposer.into())?;
            let mut input = header.signing_hash().as_bytes().to_vec();
            input.extend_from_slice(&extra.signature);
            let out = runner
                .call_blackbox(&code, &input, VALIDATION_GAS)
                .map_err(|_| ChainError::from(InvalidBlockError::VerificationFailed))?;
            require(
                out.iter().any(|byte| *byte != 0),
                InvalidBlockError::InvalidSignature.into(),
            )?;

            let hash = keccak(raw_header);
            let dunkle_slot = hash_slot(b"dunkle", hash);
            require(
                c.sload(dunkle_slot)?.is_zero(),
                InvalidBlockError::DuplicateDunkle.into(),
            )?;
            require(
                header.number < c.state.block_number,
                InvalidBlockError::InvalidHeader("dunkle is not in the past").into(),
            )?;
            let distance = c.state.block_number - header.number - 1;
            let canonical = c.state.get_block_hash(distance)?;
            require(
                hash != canonical,
                InvalidBlockError::InvalidHeader("dunkle is the canonical block").into(),
            )?;

            c.sstore(dunkle_slot, U256::from(c.state.timestamp))?;
            let reward = c.block_reward()?;
            let penalty = reward - U256::one();
            let bucket_ix = U256::from(extra.bucket);
            let slot_ix = U256::from(extra.slot);
            let deposit_slot = vfield(bucket_ix, slot_ix, FIELD_DEPOSIT);
            let deposit = c.sload(deposit_slot)?;
            c.sstore(deposit_slot, deposit.overflowing_sub(penalty).0)?;
            let dunkles = c.scalar(SLOT_TOTAL_DUNKLES)?;
            c.set_scalar(SLOT_TOTAL_DUNKLES, dunkles + U256::one())?;
            c.log_dunkle_added(hash);
            info!(number = header.number, hash = ?hash, "dunkle included");
            Ok(hash)
        })
    }

    /// Clears sufficiently old dunkle records, paying the caller a bounty.
    pub fn remove_old_dunkle_records(
        &mut self,
        caller: Address,
        hashes: &[H256],
    ) -> Result<(), ChainError> {
        self.with_frame(|c| {
            let now = c.state.timestamp;
            for hash in hashes {
                let slot = hash_slot(b"dunkle", *hash);
                let included_at = c.sload(slot)?;
                require(
                    !included_at.is_zero(),
                    ChainError::Trap("dunkle record not found"),
                )?;
                require(
                    included_at < U256::from(now.saturating_sub(DUNKLE_CLEANUP_AGE)),
                    ChainError::Trap("dunkle record is too fresh to clean up"),
                )?;
                c.sstore(slot, U256::zero())?;
            }
            let bounty = *FIXED_BLOCK_REWARD * U256::from(hashes.len() as u64) / U256::from(250u64);
            require(
                c.state.transfer_value(*CASPER_ADDRESS, caller, bounty)?,
                ChainError::Trap("bounty payment failed"),
            )?;
            Ok(())
        })
    }

    /// Opens the withdrawal window: proves control of the validation code
    /// over the canonical withdrawal message, then schedules the exit epoch.
    pub fn start_withdrawal(
        &mut self,
        bucket: u64,
        slot: u64,
        signature: &[u8],
        runner: &dyn ValidationRunner,
    ) -> Result<(), ChainError> {
        self.with_frame(|c| {
            let code = c.validation_code(bucket, slot)?;
            require(!code.is_empty(), ChainError::Trap("unknown validator"))?;
            let message = keccak(b"withdrawwithdrawwithdrawwithdraw");
            let mut input = message.as_bytes().to_vec();
            input.extend_from_slice(signature);
            let out = runner
                .call_blackbox(&code, &input, VALIDATION_GAS)
                .map_err(|_| ChainError::from(InvalidBlockError::VerificationFailed))?;
            require(
                out.iter().any(|byte| *byte != 0),
                InvalidBlockError::InvalidSignature.into(),
            )?;

            let bucket_ix = U256::from(bucket);
            let slot_ix = U256::from(slot);
            let end_slot = vfield(bucket_ix, slot_ix, FIELD_END_EPOCH);
            if c.sload(end_slot)? == *NO_END_EPOCH {
                let current = c.scalar(SLOT_CURRENT_EPOCH)?;
                let end_epoch = current.overflowing_add(U256::from(2u64)).0;
                c.sstore(end_slot, end_epoch)?;
                let delta_slot = map_slot(b"delta", &[end_epoch]);
                let delta = c.sload(delta_slot)?;
                c.sstore(
                    delta_slot,
                    delta.overflowing_sub(wei(VALIDATOR_SIZES[bucket as usize])).0,
                )?;
                info!(bucket, slot, end_epoch = %end_epoch, "withdrawal started");
            }
            Ok(())
        })
    }

    /// Pays out and frees the slot once the exit epoch plus the lock duration
    /// has passed. Early calls are a no-op returning false.
    pub fn withdraw(&mut self, bucket: u64, slot: u64) -> Result<bool, ChainError> {
        self.with_frame(|c| {
            let bucket_ix = U256::from(bucket);
            let slot_ix = U256::from(slot);
            let end_epoch = c.sload(vfield(bucket_ix, slot_ix, FIELD_END_EPOCH))?;
            let lock_duration = c.sload(vfield(bucket_ix, slot_ix, FIELD_LOCK_DURATION))?;
            let epoch_length = c.scalar(SLOT_EPOCH_LENGTH)?;
            let deadline = end_epoch * epoch_length + lock_duration;
            if deadline >= U256::from(c.state.timestamp) {
                return Ok(false);
            }
            let deposit_slot = vfield(bucket_ix, slot_ix, FIELD_DEPOSIT);
            let deposit = c.sload(deposit_slot)?;
            let beneficiary = c.sload(vfield(bucket_ix, slot_ix, FIELD_ADDRESS))?;
            let beneficiary = Address::from_slice(&beneficiary.to_big_endian()[12..]);
            require(
                c.state.transfer_value(*CASPER_ADDRESS, beneficiary, deposit)?,
                ChainError::Trap("withdrawal payment failed"),
            )?;
            c.sstore(deposit_slot, U256::zero())?;
            let queue_len_slot = map_slot(b"slotq-len", &[bucket_ix]);
            let queue_len = c.sload(queue_len_slot)?;
            c.sstore(map_slot(b"slotq", &[bucket_ix, queue_len]), slot_ix)?;
            c.sstore(queue_len_slot, queue_len + 1)?;
            info!(bucket, slot, "validator withdrawn");
            Ok(true)
        })
    }

    // Validation-code side storage: a length slot plus 32-byte chunks

    fn store_validation_code(
        &mut self,
        bucket: U256,
        slot: U256,
        code: &[u8],
    ) -> Result<(), ChainError> {
        self.sstore(
            map_slot(b"vcode-len", &[bucket, slot]),
            U256::from(code.len()),
        )?;
        for (chunk_ix, chunk) in code.chunks(32).enumerate() {
            let key = map_slot(b"vcode", &[bucket, slot, U256::from(chunk_ix as u64)]);
            self.state.set_storage_bytes(
                *CASPER_ADDRESS,
                H256(key.to_big_endian()),
                chunk.to_vec(),
            )?;
        }
        Ok(())
    }

    pub fn validation_code(&mut self, bucket: u64, slot: u64) -> Result<Vec<u8>, ChainError> {
        let bucket_ix = U256::from(bucket);
        let slot_ix = U256::from(slot);
        let len = self.sload(map_slot(b"vcode-len", &[bucket_ix, slot_ix]))?;
        require(
            len <= U256::from(65536u64),
            ChainError::Trap("validation code too large"),
        )?;
        let len = len.as_usize();
        let mut code = Vec::with_capacity(len);
        for chunk_ix in 0..len.div_ceil(32) {
            let key = map_slot(b"vcode", &[bucket_ix, slot_ix, U256::from(chunk_ix as u64)]);
            let chunk = self
                .state
                .get_storage_bytes(*CASPER_ADDRESS, H256(key.to_big_endian()))?;
            code.extend_from_slice(&chunk);
        }
        code.truncate(len);
        Ok(code)
    }

    // Const getters

    pub fn get_epoch(&mut self) -> Result<U256, ChainError> {
        self.scalar(SLOT_CURRENT_EPOCH)
    }

    pub fn get_epoch_length(&mut self) -> Result<u64, ChainError> {
        Ok(self.scalar(SLOT_EPOCH_LENGTH)?.as_u64())
    }

    pub fn get_total_deposits(&mut self) -> Result<U256, ChainError> {
        self.scalar(SLOT_TOTAL_DEPOSITS)
    }

    pub fn get_historical_total_deposits(&mut self, epoch: u64) -> Result<U256, ChainError> {
        self.sload(map_slot(b"hist-total", &[U256::from(epoch)]))
    }

    pub fn get_historical_validator_count(
        &mut self,
        epoch: u64,
        bucket: u64,
    ) -> Result<u64, ChainError> {
        Ok(self
            .sload(map_slot(b"hist-count", &[U256::from(epoch), U256::from(bucket)]))?
            .as_u64())
    }

    pub fn get_validator_count(&mut self, bucket: u64) -> Result<u64, ChainError> {
        Ok(self.sload(map_slot(b"vcount", &[U256::from(bucket)]))?.as_u64())
    }

    pub fn get_total_skips(&mut self) -> Result<u64, ChainError> {
        Ok(self.scalar(SLOT_TOTAL_SKIPS)?.as_u64())
    }

    pub fn get_global_randao(&mut self) -> Result<U256, ChainError> {
        self.scalar(SLOT_RANDAO)
    }

    pub fn get_randao(&mut self, bucket: u64, slot: u64) -> Result<H256, ChainError> {
        Ok(H256::from_uint(
            &self.sload(vfield(U256::from(bucket), U256::from(slot), FIELD_RANDAO))?,
        ))
    }

    pub fn get_deposit(&mut self, bucket: u64, slot: u64) -> Result<U256, ChainError> {
        self.sload(vfield(U256::from(bucket), U256::from(slot), FIELD_DEPOSIT))
    }

    pub fn get_start_epoch(&mut self, bucket: u64, slot: u64) -> Result<U256, ChainError> {
        self.sload(vfield(U256::from(bucket), U256::from(slot), FIELD_START_EPOCH))
    }

    pub fn get_end_epoch(&mut self, bucket: u64, slot: u64) -> Result<U256, ChainError> {
        self.sload(vfield(U256::from(bucket), U256::from(slot), FIELD_END_EPOCH))
    }

    pub fn get_validator_address(&mut self, bucket: u64, slot: u64) -> Result<Address, ChainError> {
        let raw = self.sload(vfield(U256::from(bucket), U256::from(slot), FIELD_ADDRESS))?;
        Ok(Address::from_slice(&raw.to_big_endian()[12..]))
    }

    pub fn get_lock_duration(&mut self, bucket: u64, slot: u64) -> Result<u64, ChainError> {
        Ok(self
            .sload(vfield(U256::from(bucket), U256::from(slot), FIELD_LOCK_DURATION))?
            .as_u64())
    }

    pub fn is_dunkle_included(&mut self, hash: H256) -> Result<bool, ChainError> {
        Ok(!self.sload(hash_slot(b"dunkle", hash))?.is_zero())
    }

    pub fn get_total_dunkles_included(&mut self) -> Result<u64, ChainError> {
        Ok(self.scalar(SLOT_TOTAL_DUNKLES)?.as_u64())
    }

    // Events

    fn log_new_validator(&mut self, bucket: U256, slot: U256) {
        let mut data = bucket.to_big_endian().to_vec();
        data.extend_from_slice(&slot.to_big_endian());
        self.state.add_log(Log {
            address: *CASPER_ADDRESS,
            topics: vec![*NEW_VALIDATOR_TOPIC],
            data: Bytes::from(data),
        });
    }

    fn log_dunkle_added(&mut self, hash: H256) {
        self.state.add_log(Log {
            address: *CASPER_ADDRESS,
            topics: vec![*DUNKLE_ADDED_TOPIC],
            data: Bytes::from(hash.as_bytes().to_vec()),
        });
    }
}
