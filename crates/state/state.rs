pub mod errors;
mod snapshot;
mod trie_kv;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use caspra_common::constants::{EMPTY_KECCAK_HASH, RIPEMD160_ADDR};
use caspra_common::types::{AccountState, BlockHeader, ChainConfig, Fork, Log, Receipt};
use caspra_common::{Address, Bloom, H256, U256, keccak};
use caspra_rlp::decode::RLPDecode;
use caspra_rlp::encode::RLPEncode;
use caspra_storage::{KvStore, OverlayStore};
use caspra_trie::{EMPTY_TRIE_HASH, Trie};
use tracing::debug;

pub use errors::StateError;
pub use snapshot::SnapshotData;
pub use trie_kv::TrieKv;

/// Fields of an account addressable through the write-through cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountField {
    Nonce,
    Balance,
    Code,
    /// Read-level override of the account's storage root, installed when the
    /// storage sub-trie is reset wholesale.
    StorageRoot,
    Deleted,
    /// A 32-byte storage slot key. Numeric keys are zero-left-padded.
    Slot(H256),
}

/// Typed values held by the cache, one variant per account field kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Nonce(u64),
    Balance(U256),
    Code(Bytes),
    StorageRoot(H256),
    Deleted(bool),
    Slot(Vec<u8>),
}

impl FieldValue {
    fn matches(&self, field: &AccountField) -> bool {
        matches!(
            (field, self),
            (AccountField::Nonce, FieldValue::Nonce(_))
                | (AccountField::Balance, FieldValue::Balance(_))
                | (AccountField::Code, FieldValue::Code(_))
                | (AccountField::StorageRoot, FieldValue::StorageRoot(_))
                | (AccountField::Deleted, FieldValue::Deleted(_))
                | (AccountField::Slot(_), FieldValue::Slot(_))
        )
    }
}

/// One reversible mutation. Storage entries record the previous value and
/// whether the address was already in the modified set; transient-parameter
/// entries record the previous scalar or list length.
#[derive(Debug, Clone)]
enum JournalEntry {
    Storage {
        addr: Address,
        field: AccountField,
        prev: FieldValue,
        was_modified: bool,
    },
    GasUsed(u64),
    Refunds(u64),
    Txindex(u64),
    LogsLen(usize),
    ReceiptsLen(usize),
    SuicidesLen(usize),
}

/// A revert token: the trie root and journal length at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub root: H256,
    pub journal_len: usize,
}

pub(crate) const SECURE_KEY_PREFIX: &[u8] = b"secure-key-";

/// The transactional world state: a Merkle-Patricia account trie overlaid
/// with a write-through cache, a journal supporting nested snapshot/revert,
/// and the transient per-block execution parameters.
///
/// Exactly one transaction-or-block executes against a `State` at a time;
/// speculative executions run on [State::ephemeral_clone]s.
pub struct State {
    config: ChainConfig,
    store: Arc<dyn KvStore>,
    trie: Trie,
    cache: HashMap<Address, HashMap<AccountField, FieldValue>>,
    modified: HashMap<Address, HashSet<AccountField>>,
    journal: Vec<JournalEntry>,

    // Transient per-block parameters
    pub block_number: u64,
    pub timestamp: u64,
    pub block_coinbase: Address,
    pub block_difficulty: U256,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub bloom: Bloom,
    pub txindex: u64,
    pub refunds: u64,
    pub logs: Vec<Log>,
    pub receipts: Vec<Receipt>,
    pub suicides: Vec<Address>,
    pub prev_headers: Vec<BlockHeader>,
    pub recent_uncles: BTreeMap<u64, Vec<H256>>,
}

pub(crate) fn hash_address(address: &Address) -> Vec<u8> {
    keccak(address.as_bytes()).as_bytes().to_vec()
}

pub(crate) fn hash_key(key: &H256) -> Vec<u8> {
    keccak(key.as_bytes()).as_bytes().to_vec()
}

pub(crate) fn u256_to_h256(value: U256) -> H256 {
    H256(value.to_big_endian())
}

fn h256_from_padded(bytes: &[u8]) -> H256 {
    let mut padded = [0u8; 32];
    let len = bytes.len().min(32);
    padded[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    H256(padded)
}

impl State {
    /// Creates a state over an empty account trie.
    pub fn new(store: Arc<dyn KvStore>, config: ChainConfig) -> Result<Self, StateError> {
        Self::open(store, config, *EMPTY_TRIE_HASH)
    }

    /// Creates a state whose account trie is rooted at `root` in the given store.
    pub fn open(
        store: Arc<dyn KvStore>,
        config: ChainConfig,
        root: H256,
    ) -> Result<Self, StateError> {
        // The empty code record backs every blank account
        store.put(EMPTY_KECCAK_HASH.as_bytes().to_vec(), Vec::new())?;
        let trie = Trie::open(Box::new(TrieKv::new(store.clone())), root);
        Ok(Self {
            config,
            store,
            trie,
            cache: HashMap::new(),
            modified: HashMap::new(),
            journal: Vec::new(),
            block_number: 0,
            timestamp: 0,
            block_coinbase: Address::zero(),
            block_difficulty: U256::one(),
            gas_used: 0,
            gas_limit: caspra_common::constants::DEFAULT_GAS_LIMIT,
            bloom: Bloom::zero(),
            txindex: 0,
            refunds: 0,
            logs: Vec::new(),
            receipts: Vec::new(),
            suicides: Vec::new(),
            prev_headers: Vec::new(),
            recent_uncles: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    fn open_trie(&self, root: H256) -> Trie {
        Trie::open(Box::new(TrieKv::new(self.store.clone())), root)
    }

    /// Reads the committed account record, bypassing the cache.
    fn get_account_uncached(&self, addr: Address) -> Result<AccountState, StateError> {
        match self.trie.get(&hash_address(&addr))? {
            Some(rlp) => Ok(AccountState::decode(&rlp)?),
            None => Ok(AccountState::blank(self.config.account_initial_nonce)),
        }
    }

    /// Core cached read. Resolves account-special fields from the account
    /// record and slot keys from the storage sub-trie, then caches the result.
    pub fn get_storage(
        &mut self,
        addr: Address,
        field: AccountField,
    ) -> Result<FieldValue, StateError> {
        if let Some(value) = self.cache.get(&addr).and_then(|sub| sub.get(&field)) {
            return Ok(value.clone());
        }
        let account = self.get_account_uncached(addr)?;
        let value = match &field {
            AccountField::Nonce => FieldValue::Nonce(account.nonce),
            AccountField::Balance => FieldValue::Balance(account.balance),
            AccountField::StorageRoot => FieldValue::StorageRoot(account.storage_root),
            AccountField::Deleted => FieldValue::Deleted(false),
            AccountField::Code => {
                let code = self
                    .store
                    .get(account.code_hash.as_bytes())?
                    .unwrap_or_default();
                FieldValue::Code(Bytes::from(code))
            }
            AccountField::Slot(key) => {
                // A pending storage reset overrides the sub-trie root for reads
                let root = match self.cache.get(&addr).and_then(|sub| sub.get(&AccountField::StorageRoot)) {
                    Some(FieldValue::StorageRoot(root)) => *root,
                    _ => account.storage_root,
                };
                let sub_trie = self.open_trie(root);
                let value = sub_trie
                    .get(&hash_key(key))?
                    .map(|rlp| Bytes::decode(&rlp))
                    .transpose()?
                    .map(|bytes| bytes.to_vec())
                    .unwrap_or_default();
                FieldValue::Slot(value)
            }
        };
        self.cache
            .entry(addr)
            .or_default()
            .insert(field, value.clone());
        Ok(value)
    }

    /// Core journalled write: records the previous value (and a pending
    /// deletion mark, if one is being overwritten), updates the cache and the
    /// modified set.
    pub fn set_storage(
        &mut self,
        addr: Address,
        field: AccountField,
        value: FieldValue,
    ) -> Result<(), StateError> {
        if !value.matches(&field) {
            return Err(StateError::StorageTypeMismatch);
        }
        if let FieldValue::Slot(bytes) = &value {
            if bytes.len() > 32 {
                return Err(StateError::StorageValueTooLong);
            }
        }
        let preval = self.get_storage(addr, field.clone())?;
        let was_modified = self.modified.contains_key(&addr);
        self.journal.push(JournalEntry::Storage {
            addr,
            field: field.clone(),
            prev: preval,
            was_modified,
        });
        let pending_delete = matches!(
            self.cache
                .get(&addr)
                .and_then(|sub| sub.get(&AccountField::Deleted)),
            Some(FieldValue::Deleted(true))
        );
        if pending_delete {
            self.journal.push(JournalEntry::Storage {
                addr,
                field: AccountField::Deleted,
                prev: FieldValue::Deleted(true),
                was_modified,
            });
            self.cache
                .entry(addr)
                .or_default()
                .insert(AccountField::Deleted, FieldValue::Deleted(false));
        }
        self.cache.entry(addr).or_default().insert(field.clone(), value);
        self.modified.entry(addr).or_default().insert(field);
        Ok(())
    }

    // Typed accessors over the cached storage

    pub fn get_nonce(&mut self, addr: Address) -> Result<u64, StateError> {
        match self.get_storage(addr, AccountField::Nonce)? {
            FieldValue::Nonce(nonce) => Ok(nonce),
            _ => Err(StateError::StorageTypeMismatch),
        }
    }

    pub fn set_nonce(&mut self, addr: Address, nonce: u64) -> Result<(), StateError> {
        self.set_storage(addr, AccountField::Nonce, FieldValue::Nonce(nonce))
    }

    pub fn increment_nonce(&mut self, addr: Address) -> Result<(), StateError> {
        let nonce = self.get_nonce(addr)?;
        self.set_nonce(addr, nonce + 1)
    }

    pub fn get_balance(&mut self, addr: Address) -> Result<U256, StateError> {
        match self.get_storage(addr, AccountField::Balance)? {
            FieldValue::Balance(balance) => Ok(balance),
            _ => Err(StateError::StorageTypeMismatch),
        }
    }

    pub fn set_balance(&mut self, addr: Address, balance: U256) -> Result<(), StateError> {
        self.set_storage(addr, AccountField::Balance, FieldValue::Balance(balance))
    }

    pub fn add_balance(&mut self, addr: Address, amount: U256) -> Result<(), StateError> {
        let balance = self.get_balance(addr)?;
        self.set_balance(addr, balance + amount)
    }

    /// Saturating decrement; callers guard the balance themselves.
    pub fn sub_balance(&mut self, addr: Address, amount: U256) -> Result<(), StateError> {
        let balance = self.get_balance(addr)?;
        self.set_balance(addr, balance.saturating_sub(amount))
    }

    pub fn get_code(&mut self, addr: Address) -> Result<Bytes, StateError> {
        match self.get_storage(addr, AccountField::Code)? {
            FieldValue::Code(code) => Ok(code),
            _ => Err(StateError::StorageTypeMismatch),
        }
    }

    pub fn set_code(&mut self, addr: Address, code: Bytes) -> Result<(), StateError> {
        self.set_storage(addr, AccountField::Code, FieldValue::Code(code))
    }

    pub fn get_storage_bytes(&mut self, addr: Address, key: H256) -> Result<Vec<u8>, StateError> {
        match self.get_storage(addr, AccountField::Slot(key))? {
            FieldValue::Slot(value) => Ok(value),
            _ => Err(StateError::StorageTypeMismatch),
        }
    }

    pub fn set_storage_bytes(
        &mut self,
        addr: Address,
        key: H256,
        value: Vec<u8>,
    ) -> Result<(), StateError> {
        self.set_storage(addr, AccountField::Slot(key), FieldValue::Slot(value))
    }

    /// Reads a storage slot as an unsigned integer (big-endian).
    pub fn get_storage_data(&mut self, addr: Address, key: U256) -> Result<U256, StateError> {
        let raw = self.get_storage_bytes(addr, u256_to_h256(key))?;
        Ok(U256::from_big_endian(&raw[raw.len().saturating_sub(32)..]))
    }

    /// Writes a storage slot as an unsigned integer. Zero is stored as the
    /// empty byte string, which commits as a deletion.
    pub fn set_storage_data(
        &mut self,
        addr: Address,
        key: U256,
        value: U256,
    ) -> Result<(), StateError> {
        let bytes = value.to_big_endian();
        let skip = (value.leading_zeros() / 8) as usize;
        self.set_storage_bytes(addr, u256_to_h256(key), bytes[skip..].to_vec())
    }

    /// Moves `value` from one balance to another. Fails (as a no-op returning
    /// false) when the source balance is insufficient; the caller is expected
    /// to have snapshotted beforehand.
    pub fn transfer_value(
        &mut self,
        from: Address,
        to: Address,
        value: U256,
    ) -> Result<bool, StateError> {
        if self.get_balance(from)? < value {
            return Ok(false);
        }
        self.sub_balance(from, value)?;
        self.add_balance(to, value)?;
        Ok(true)
    }

    /// True iff the account exists for protocol purposes: EIP-161 semantics
    /// under SPURIOUS_DRAGON, trie presence before it.
    pub fn account_exists(&mut self, addr: Address) -> Result<bool, StateError> {
        if self.is_fork(Fork::SpuriousDragon) {
            return Ok(self.get_nonce(addr)? != 0
                || !self.get_balance(addr)?.is_zero()
                || !self.get_code(addr)?.is_empty());
        }
        if !self.modified.contains_key(&addr) {
            return Ok(self.trie.get(&hash_address(&addr))?.is_some());
        }
        let deleted = matches!(
            self.cache
                .get(&addr)
                .and_then(|sub| sub.get(&AccountField::Deleted)),
            Some(FieldValue::Deleted(true))
        );
        Ok(!deleted)
    }

    /// Installs a blank storage root for the account and issues an explicit
    /// empty-write over every cached and committed storage key, so journaling
    /// and revert behave uniformly.
    pub fn reset_storage(&mut self, addr: Address) -> Result<(), StateError> {
        self.set_storage(
            addr,
            AccountField::StorageRoot,
            FieldValue::StorageRoot(*EMPTY_TRIE_HASH),
        )?;
        let cached_keys: Vec<H256> = self
            .cache
            .get(&addr)
            .map(|sub| {
                sub.keys()
                    .filter_map(|field| match field {
                        AccountField::Slot(key) => Some(*key),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for key in cached_keys {
            self.set_storage_bytes(addr, key, Vec::new())?;
        }
        let account = self.get_account_uncached(addr)?;
        let sub_trie = self.open_trie(account.storage_root);
        for hashed in sub_trie.to_dict()?.keys() {
            let key = self.preimage(hashed)?;
            self.set_storage_bytes(addr, h256_from_padded(&key), Vec::new())?;
        }
        Ok(())
    }

    /// Resets every outputtable field to its blank-account value, clears the
    /// storage sub-trie and marks the account deleted.
    pub fn del_account(&mut self, addr: Address) -> Result<(), StateError> {
        self.reset_storage(addr)?;
        self.set_balance(addr, U256::zero())?;
        self.set_nonce(addr, 0)?;
        self.set_code(addr, Bytes::new())?;
        self.set_storage(addr, AccountField::Deleted, FieldValue::Deleted(true))
    }

    /// Returns a revert token for the current trie root and journal length.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.trie.hash_no_commit(),
            journal_len: self.journal.len(),
        }
    }

    /// Reverts to the given snapshot: pops journal entries back to its length
    /// and, for a root-only snapshot, resets the trie and drops the cache.
    /// Reverting across a commit boundary is a programming error and fails.
    pub fn revert(&mut self, snapshot: Snapshot) -> Result<(), StateError> {
        let current_root = self.trie.hash_no_commit();
        if snapshot.root != current_root && snapshot.journal_len != 0 {
            return Err(StateError::SnapshotAcrossCommit);
        }
        let root_changed = snapshot.root != current_root;
        if root_changed {
            self.trie = self.open_trie(snapshot.root);
            self.cache.clear();
            self.modified.clear();
        }
        while self.journal.len() > snapshot.journal_len {
            let Some(entry) = self.journal.pop() else {
                break;
            };
            match entry {
                JournalEntry::Storage {
                    addr,
                    field,
                    prev,
                    was_modified,
                } => {
                    if !root_changed {
                        self.cache.entry(addr).or_default().insert(field, prev);
                        // Sync up with Parity's EIP-161 bug: keep ripemd160 in
                        // the modified set so account cleaning still triggers.
                        // https://github.com/ethereum/go-ethereum/pull/3341
                        if !was_modified && addr != *RIPEMD160_ADDR {
                            self.modified.remove(&addr);
                        }
                    }
                }
                JournalEntry::GasUsed(prev) => self.gas_used = prev,
                JournalEntry::Refunds(prev) => self.refunds = prev,
                JournalEntry::Txindex(prev) => self.txindex = prev,
                JournalEntry::LogsLen(len) => self.logs.truncate(len),
                JournalEntry::ReceiptsLen(len) => self.receipts.truncate(len),
                JournalEntry::SuicidesLen(len) => self.suicides.truncate(len),
            }
        }
        Ok(())
    }

    /// Writes the cache back into the tries and clears cache, modified set and
    /// journal. Returns the new account-trie root.
    ///
    /// Under SPURIOUS_DRAGON, accounts left blank are deleted from the trie
    /// unless `allow_empties` is set.
    pub fn commit_with(&mut self, allow_empties: bool) -> Result<H256, StateError> {
        let spurious_dragon = self.is_fork(Fork::SpuriousDragon);
        let mut addrs: Vec<Address> = self
            .cache
            .keys()
            .filter(|addr| self.modified.contains_key(addr))
            .copied()
            .collect();
        addrs.sort_unstable();
        for addr in addrs {
            let mut account = self.get_account_uncached(addr)?;
            // The storage root is recomputed from the committed root plus the
            // journalled slot writes; a cached StorageRoot override only ever
            // served reads.
            let mut sub_trie = self.open_trie(account.storage_root);
            let subcache = self.cache.get(&addr).cloned().unwrap_or_default();
            let modified_fields = self.modified.get(&addr).cloned().unwrap_or_default();
            let mut deleted = false;
            for (field, value) in &subcache {
                match (field, value) {
                    (AccountField::Nonce, FieldValue::Nonce(nonce)) => account.nonce = *nonce,
                    (AccountField::Balance, FieldValue::Balance(balance)) => {
                        account.balance = *balance
                    }
                    (AccountField::Deleted, FieldValue::Deleted(flag)) => deleted = *flag,
                    (AccountField::StorageRoot, _) => {}
                    (AccountField::Code, FieldValue::Code(code)) => {
                        let code_hash = keccak(code);
                        if code_hash != account.code_hash {
                            account.code_hash = code_hash;
                            self.store
                                .inc_refcount(code_hash.as_bytes().to_vec(), code.to_vec())?;
                        }
                    }
                    (AccountField::Slot(key), FieldValue::Slot(value)) => {
                        if !modified_fields.contains(field) {
                            continue;
                        }
                        let path = hash_key(key);
                        let current = sub_trie
                            .get(&path)?
                            .map(|rlp| Bytes::decode(&rlp))
                            .transpose()?
                            .map(|bytes| bytes.to_vec())
                            .unwrap_or_default();
                        if *value != current {
                            if value.is_empty() {
                                sub_trie.remove(path)?;
                            } else {
                                self.record_preimage(key.as_bytes())?;
                                sub_trie.insert(path, value.as_slice().encode_to_vec())?;
                            }
                        }
                    }
                    // set_storage type-checks writes, so a mismatch cannot be cached
                    _ => return Err(StateError::StorageTypeMismatch),
                }
            }
            account.storage_root = sub_trie.hash()?;
            let account_path = hash_address(&addr);
            if deleted {
                self.trie.remove(account_path)?;
            } else if spurious_dragon && account.is_blank() && !allow_empties {
                self.trie.remove(account_path)?;
            } else {
                self.record_preimage(addr.as_bytes())?;
                self.trie.insert(account_path, account.encode_to_vec())?;
            }
        }
        self.cache.clear();
        self.modified.clear();
        self.journal.clear();
        let root = self.trie.hash()?;
        debug!(root = ?root, "state committed");
        Ok(root)
    }

    pub fn commit(&mut self) -> Result<H256, StateError> {
        self.commit_with(false)
    }

    /// Produces an isolated copy backed by an overlay KV on the same base, so
    /// speculative execution cannot leak writes into the shared store.
    pub fn ephemeral_clone(&self) -> Result<State, StateError> {
        let store: Arc<dyn KvStore> = Arc::new(OverlayStore::new(self.store.clone()));
        let trie = Trie::open(
            Box::new(TrieKv::new(store.clone())),
            self.trie.hash_no_commit(),
        );
        Ok(State {
            config: self.config,
            store,
            trie,
            cache: self.cache.clone(),
            modified: self.modified.clone(),
            journal: self.journal.clone(),
            block_number: self.block_number,
            timestamp: self.timestamp,
            block_coinbase: self.block_coinbase,
            block_difficulty: self.block_difficulty,
            gas_used: self.gas_used,
            gas_limit: self.gas_limit,
            bloom: self.bloom,
            txindex: self.txindex,
            refunds: self.refunds,
            logs: self.logs.clone(),
            receipts: self.receipts.clone(),
            suicides: self.suicides.clone(),
            prev_headers: self.prev_headers.clone(),
            recent_uncles: self.recent_uncles.clone(),
        })
    }

    // Fork predicates

    pub fn is_fork(&self, fork: Fork) -> bool {
        self.config.is_fork_active(fork, self.block_number)
    }

    pub fn is_at_fork(&self, fork: Fork) -> bool {
        self.config.is_at_fork_height(fork, self.block_number)
    }

    // Block-hash lookup

    /// Returns the hash of the block `distance + 1` blocks behind the one
    /// being processed. Pre-METROPOLIS this reads the retained header list;
    /// post-METROPOLIS it reads the blockhash-store contract's ring buffer.
    pub fn get_block_hash(&mut self, distance: u64) -> Result<H256, StateError> {
        if self.is_fork(Fork::Metropolis) {
            if distance >= self.block_number || distance >= self.config.metropolis_wraparound {
                return Ok(H256::zero());
            }
            let slot = (self.block_number - distance - 1) % self.config.metropolis_wraparound;
            let store_addr = self.config.metropolis_blockhash_store;
            let raw = self.get_storage_bytes(store_addr, u256_to_h256(U256::from(slot)))?;
            if raw.is_empty() {
                Ok(H256::zero())
            } else {
                Ok(h256_from_padded(&raw))
            }
        } else {
            if distance > 256 {
                return Ok(H256::zero());
            }
            Ok(self
                .prev_headers
                .get(distance as usize)
                .map(|header| header.compute_block_hash())
                .unwrap_or_default())
        }
    }

    /// Pushes a processed header onto the front of the retained header list.
    pub fn add_block_header(&mut self, header: BlockHeader) {
        self.prev_headers.insert(0, header);
    }

    // Journalled transient-parameter mutators

    pub fn set_gas_used(&mut self, gas_used: u64) {
        self.journal.push(JournalEntry::GasUsed(self.gas_used));
        self.gas_used = gas_used;
    }

    pub fn set_txindex(&mut self, txindex: u64) {
        self.journal.push(JournalEntry::Txindex(self.txindex));
        self.txindex = txindex;
    }

    pub fn add_refund(&mut self, amount: u64) {
        self.journal.push(JournalEntry::Refunds(self.refunds));
        self.refunds += amount;
    }

    pub fn add_log(&mut self, log: Log) {
        self.journal.push(JournalEntry::LogsLen(self.logs.len()));
        self.logs.push(log);
    }

    pub fn add_receipt(&mut self, receipt: Receipt) {
        self.journal
            .push(JournalEntry::ReceiptsLen(self.receipts.len()));
        self.receipts.push(receipt);
    }

    pub fn add_suicide(&mut self, addr: Address) {
        self.journal
            .push(JournalEntry::SuicidesLen(self.suicides.len()));
        self.suicides.push(addr);
    }

    // Secure-trie preimage bookkeeping

    fn record_preimage(&self, raw: &[u8]) -> Result<(), StateError> {
        let mut key = SECURE_KEY_PREFIX.to_vec();
        key.extend_from_slice(keccak(raw).as_bytes());
        self.store.put(key, raw.to_vec())?;
        Ok(())
    }

    pub(crate) fn preimage(&self, hashed: &[u8]) -> Result<Vec<u8>, StateError> {
        let mut key = SECURE_KEY_PREFIX.to_vec();
        key.extend_from_slice(hashed);
        self.store.get(&key)?.ok_or(StateError::MissingPreimage)
    }

    pub(crate) fn account_trie(&self) -> &Trie {
        &self.trie
    }

    pub(crate) fn set_root(&mut self, root: H256) {
        self.trie = self.open_trie(root);
        self.cache.clear();
        self.modified.clear();
        self.journal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caspra_common::types::ConsensusKind;
    use caspra_storage::InMemoryStore;

    fn test_store() -> Arc<dyn KvStore> {
        Arc::new(InMemoryStore::new())
    }

    fn new_state() -> State {
        State::new(test_store(), ChainConfig::default()).unwrap()
    }

    fn new_state_all_forks() -> State {
        State::new(
            test_store(),
            ChainConfig::all_forks_at_genesis(ConsensusKind::Pow),
        )
        .unwrap()
    }

    fn addr(byte: u8) -> Address {
        Address::from_slice(&[byte; 20])
    }

    #[test]
    fn snapshot_revert_restores_balances() {
        let mut state = new_state();
        state.set_balance(addr(0xAA), U256::from(100)).unwrap();
        state.set_balance(addr(0xBB), U256::from(200)).unwrap();
        state.commit().unwrap();

        let snapshot = state.snapshot();
        state.set_balance(addr(0xAA), U256::from(10)).unwrap();
        state.set_balance(addr(0xBB), U256::from(20)).unwrap();
        state.revert(snapshot).unwrap();

        assert_eq!(state.get_balance(addr(0xAA)).unwrap(), U256::from(100));
        assert_eq!(state.get_balance(addr(0xBB)).unwrap(), U256::from(200));
        assert_eq!(state.journal.len(), snapshot.journal_len);
        // Reverting to the same snapshot again is a no-op
        state.revert(snapshot).unwrap();
        assert_eq!(state.get_balance(addr(0xAA)).unwrap(), U256::from(100));
    }

    #[test]
    fn revert_across_commit_fails_loudly() {
        let mut state = new_state();
        state.set_balance(addr(0x01), U256::from(5)).unwrap();
        let snapshot = state.snapshot();
        state.set_balance(addr(0x01), U256::from(6)).unwrap();
        state.commit().unwrap();
        assert!(matches!(
            state.revert(snapshot),
            Err(StateError::SnapshotAcrossCommit)
        ));
    }

    #[test]
    fn commit_is_idempotent() {
        let mut state = new_state();
        state.set_balance(addr(0x07), U256::from(777)).unwrap();
        state
            .set_storage_data(addr(0x07), U256::from(1), U256::from(2))
            .unwrap();
        let first = state.commit().unwrap();
        let second = state.commit().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn storage_survives_reopen() {
        let store = test_store();
        let config = ChainConfig::default();
        let mut state = State::new(store.clone(), config).unwrap();
        state
            .set_storage_data(addr(0x42), U256::from(3), U256::from(99))
            .unwrap();
        state.set_nonce(addr(0x42), 9).unwrap();
        let root = state.commit().unwrap();

        let mut reopened = State::open(store, config, root).unwrap();
        assert_eq!(
            reopened
                .get_storage_data(addr(0x42), U256::from(3))
                .unwrap(),
            U256::from(99)
        );
        assert_eq!(reopened.get_nonce(addr(0x42)).unwrap(), 9);
        // Unset slots read as empty
        assert!(reopened
            .get_storage_bytes(addr(0x42), u256_to_h256(U256::from(4)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn zero_write_deletes_storage_entry() {
        let mut state = new_state();
        state
            .set_storage_data(addr(0x55), U256::from(1), U256::from(11))
            .unwrap();
        state.set_balance(addr(0x55), U256::from(1)).unwrap();
        state.commit().unwrap();

        state
            .set_storage_data(addr(0x55), U256::from(1), U256::zero())
            .unwrap();
        state.commit().unwrap();

        let account = state.get_account_uncached(addr(0x55)).unwrap();
        assert_eq!(account.storage_root, *EMPTY_TRIE_HASH);
    }

    #[test]
    fn transfer_value_checks_balance() {
        let mut state = new_state();
        state.set_balance(addr(0x01), U256::from(50)).unwrap();
        assert!(state
            .transfer_value(addr(0x01), addr(0x02), U256::from(30))
            .unwrap());
        assert_eq!(state.get_balance(addr(0x01)).unwrap(), U256::from(20));
        assert_eq!(state.get_balance(addr(0x02)).unwrap(), U256::from(30));
        // Insufficient balance is a no-op returning failure
        assert!(!state
            .transfer_value(addr(0x01), addr(0x02), U256::from(100))
            .unwrap());
        assert_eq!(state.get_balance(addr(0x01)).unwrap(), U256::from(20));
    }

    #[test]
    fn account_exists_follows_eip161() {
        let mut state = new_state_all_forks();
        assert!(!state.account_exists(addr(0x10)).unwrap());
        state.set_balance(addr(0x10), U256::from(1)).unwrap();
        assert!(state.account_exists(addr(0x10)).unwrap());
        state.set_balance(addr(0x10), U256::zero()).unwrap();
        assert!(!state.account_exists(addr(0x10)).unwrap());
        state.set_code(addr(0x10), Bytes::from_static(&[1])).unwrap();
        assert!(state.account_exists(addr(0x10)).unwrap());
    }

    #[test]
    fn empty_accounts_are_pruned_at_commit() {
        let mut state = new_state_all_forks();
        state.set_balance(addr(0x20), U256::zero()).unwrap();
        state.commit().unwrap();
        assert!(state.trie.get(&hash_address(&addr(0x20))).unwrap().is_none());

        // allow_empties keeps the blank account in the trie
        state.set_balance(addr(0x21), U256::zero()).unwrap();
        state.commit_with(true).unwrap();
        assert!(state.trie.get(&hash_address(&addr(0x21))).unwrap().is_some());
    }

    #[test]
    fn del_account_clears_everything() {
        let mut state = new_state();
        state.set_balance(addr(0x30), U256::from(10)).unwrap();
        state.set_nonce(addr(0x30), 2).unwrap();
        state
            .set_storage_data(addr(0x30), U256::from(7), U256::from(8))
            .unwrap();
        state.set_code(addr(0x30), Bytes::from_static(&[0xFE])).unwrap();
        state.commit().unwrap();

        state.del_account(addr(0x30)).unwrap();
        state.commit().unwrap();

        assert!(state.trie.get(&hash_address(&addr(0x30))).unwrap().is_none());
        assert_eq!(state.get_balance(addr(0x30)).unwrap(), U256::zero());
        assert!(state
            .get_storage_data(addr(0x30), U256::from(7))
            .unwrap()
            .is_zero());
    }

    #[test]
    fn deletion_mark_cleared_by_subsequent_write() {
        let mut state = new_state();
        state.set_balance(addr(0x31), U256::from(1)).unwrap();
        state.commit().unwrap();
        state.del_account(addr(0x31)).unwrap();
        state.set_balance(addr(0x31), U256::from(5)).unwrap();
        state.commit().unwrap();
        // The later write revives the account
        assert!(state.trie.get(&hash_address(&addr(0x31))).unwrap().is_some());
        assert_eq!(state.get_balance(addr(0x31)).unwrap(), U256::from(5));
    }

    #[test]
    fn ripemd160_stays_modified_after_revert() {
        let mut state = new_state();
        let other = addr(0x77);
        let snapshot = state.snapshot();
        state.set_balance(*RIPEMD160_ADDR, U256::zero()).unwrap();
        state.set_balance(other, U256::zero()).unwrap();
        state.revert(snapshot).unwrap();
        assert!(state.modified.contains_key(&*RIPEMD160_ADDR));
        assert!(!state.modified.contains_key(&other));
    }

    #[test]
    fn journalled_params_revert() {
        let mut state = new_state();
        let snapshot = state.snapshot();
        state.set_gas_used(21000);
        state.add_refund(15000);
        state.add_log(Log {
            address: addr(0x01),
            topics: vec![],
            data: Bytes::new(),
        });
        state.add_suicide(addr(0x02));
        state.revert(snapshot).unwrap();
        assert_eq!(state.gas_used, 0);
        assert_eq!(state.refunds, 0);
        assert!(state.logs.is_empty());
        assert!(state.suicides.is_empty());
    }

    #[test]
    fn ephemeral_clone_isolates_writes() {
        let store = test_store();
        let mut state = State::new(store.clone(), ChainConfig::default()).unwrap();
        state.set_balance(addr(0x44), U256::from(100)).unwrap();
        let base_root = state.commit().unwrap();

        let mut clone = state.ephemeral_clone().unwrap();
        clone.set_balance(addr(0x44), U256::from(999)).unwrap();
        let clone_root = clone.commit().unwrap();
        assert_ne!(clone_root, base_root);
        assert_eq!(clone.get_balance(addr(0x44)).unwrap(), U256::from(999));

        // The base state and its store never observe the clone's writes
        assert_eq!(state.get_balance(addr(0x44)).unwrap(), U256::from(100));
        assert_eq!(state.commit().unwrap(), base_root);
    }

    #[test]
    fn block_hash_from_prev_headers() {
        let mut state = new_state();
        let header = caspra_common::types::BlockHeader {
            number: 5,
            ..Default::default()
        };
        state.block_number = 6;
        state.add_block_header(header.clone());
        assert_eq!(
            state.get_block_hash(0).unwrap(),
            header.compute_block_hash()
        );
        assert_eq!(state.get_block_hash(300).unwrap(), H256::zero());
    }

    #[test]
    fn block_hash_from_metropolis_ring_buffer() {
        let mut state = new_state_all_forks();
        state.block_number = 10;
        let stored = H256::from_low_u64_be(0xBEEF);
        // Hash of block 7 sits at ring slot (10 - 2 - 1)
        state
            .set_storage_bytes(
                state.config.metropolis_blockhash_store,
                u256_to_h256(U256::from(7)),
                stored.as_bytes().to_vec(),
            )
            .unwrap();
        assert_eq!(state.get_block_hash(2).unwrap(), stored);
        assert_eq!(state.get_block_hash(10).unwrap(), H256::zero());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any mutation sequence between snapshot and revert leaves the
            // state observationally identical to the snapshot point.
            #[test]
            fn snapshot_revert_roundtrip(
                ops in proptest::collection::vec((0u8..8, 0u8..4, 1u64..1000), 1..40)
            ) {
                let mut state = new_state();
                for i in 0..4u8 {
                    state.set_balance(addr(i), U256::from(i as u64 * 100)).unwrap();
                }
                state.commit().unwrap();
                let snapshot = state.snapshot();

                for (kind, who, value) in &ops {
                    let target = addr(*who);
                    match kind % 4 {
                        0 => state.set_balance(target, U256::from(*value)).unwrap(),
                        1 => state.set_nonce(target, *value).unwrap(),
                        2 => state
                            .set_storage_data(target, U256::from(*kind), U256::from(*value))
                            .unwrap(),
                        _ => state
                            .set_code(target, Bytes::from(value.to_be_bytes().to_vec()))
                            .unwrap(),
                    }
                }

                state.revert(snapshot).unwrap();
                prop_assert_eq!(state.journal.len(), snapshot.journal_len);
                for i in 0..4u8 {
                    prop_assert_eq!(
                        state.get_balance(addr(i)).unwrap(),
                        U256::from(i as u64 * 100)
                    );
                    prop_assert_eq!(state.get_nonce(addr(i)).unwrap(), 0);
                }
                // Committing after the revert reproduces the snapshot root
                prop_assert_eq!(state.commit().unwrap(), snapshot.root);
            }
        }
    }

    #[test]
    fn storage_type_mismatch_is_rejected() {
        let mut state = new_state();
        assert!(matches!(
            state.set_storage(addr(0x01), AccountField::Nonce, FieldValue::Balance(U256::one())),
            Err(StateError::StorageTypeMismatch)
        ));
        assert!(matches!(
            state.set_storage_bytes(addr(0x01), H256::zero(), vec![0; 33]),
            Err(StateError::StorageValueTooLong)
        ));
    }
}
