pub mod db;
pub mod error;
mod nibbles;
mod node;
mod node_hash;
mod state;
mod trie_iter;

use ethereum_types::H256;
use sha3::{Digest, Keccak256};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub use self::db::{InMemoryTrieDB, TrieDB};
pub use self::nibbles::Nibbles;
pub use self::{node::Node, node_hash::NodeHash, state::TrieState};

pub use self::error::TrieError;
use self::{node::LeafNode, trie_iter::TrieIterator};

use caspra_rlp::constants::RLP_NULL;
use lazy_static::lazy_static;

lazy_static! {
    // Hash value for an empty trie, equal to keccak(RLP_NULL)
    pub static ref EMPTY_TRIE_HASH: H256 = H256::from_slice(
        Keccak256::new()
            .chain_update([RLP_NULL])
            .finalize()
            .as_slice(),
    );
}

/// RLP-encoded trie path
pub type PathRLP = Vec<u8>;
/// RLP-encoded trie value
pub type ValueRLP = Vec<u8>;

/// Ethereum Compatible Merkle Patricia Trie
pub struct Trie {
    /// Reference to the current root node
    root: Option<NodeHash>,
    /// Contains the trie's nodes
    pub(crate) state: TrieState,
}

impl Trie {
    /// Creates a new Trie from a clean DB
    pub fn new(db: Box<dyn TrieDB>) -> Self {
        Self {
            state: TrieState::new(db),
            root: None,
        }
    }

    /// Creates a trie from an already-initialized DB and sets root as the root node of the trie
    pub fn open(db: Box<dyn TrieDB>, root: H256) -> Self {
        let root = (root != *EMPTY_TRIE_HASH).then_some(root.into());
        Self {
            state: TrieState::new(db),
            root,
        }
    }

    /// Retrieve a value from the trie given its path.
    pub fn get(&self, path: &PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        if let Some(root) = &self.root {
            let root_node = self
                .state
                .get_node(root.clone())?
                .ok_or(TrieError::InconsistentTree)?;
            root_node.get(&self.state, Nibbles::from_bytes(path))
        } else {
            Ok(None)
        }
    }

    /// Insert a value into the trie.
    pub fn insert(&mut self, path: PathRLP, value: ValueRLP) -> Result<(), TrieError> {
        let root = self.root.take();
        if let Some(root_node) = root
            .map(|root| self.state.get_node(root))
            .transpose()?
            .flatten()
        {
            // If the trie is not empty, call the root node's insertion logic
            let root_node = root_node.insert(&mut self.state, Nibbles::from_bytes(&path), value)?;
            self.root = Some(root_node.insert_self(&mut self.state)?)
        } else {
            // If the trie is empty, just add a leaf.
            let new_leaf = Node::from(LeafNode::new(Nibbles::from_bytes(&path), value));
            self.root = Some(new_leaf.insert_self(&mut self.state)?)
        }
        Ok(())
    }

    /// Remove a value from the trie given its path.
    /// Returns the value if it was succesfully removed or None if it wasn't part of the trie
    pub fn remove(&mut self, path: PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        let root = self.root.take();
        if let Some(root) = root {
            let root_node = self
                .state
                .get_node(root)?
                .ok_or(TrieError::InconsistentTree)?;
            let (root_node, old_value) =
                root_node.remove(&mut self.state, Nibbles::from_bytes(&path))?;
            self.root = root_node
                .map(|root| root.insert_self(&mut self.state))
                .transpose()?;
            Ok(old_value)
        } else {
            Ok(None)
        }
    }

    /// Return the hash of the trie's root node.
    /// Returns keccak(RLP_NULL) if the trie is empty
    /// Also commits changes to the DB
    pub fn hash(&mut self) -> Result<H256, TrieError> {
        self.commit()?;
        Ok(self
            .root
            .as_ref()
            .map(|root| root.finalize())
            .unwrap_or(*EMPTY_TRIE_HASH))
    }

    /// Return the hash of the trie's root node.
    /// Returns keccak(RLP_NULL) if the trie is empty
    pub fn hash_no_commit(&self) -> H256 {
        self.root
            .as_ref()
            .map(|root| root.finalize())
            .unwrap_or(*EMPTY_TRIE_HASH)
    }

    pub fn commit(&mut self) -> Result<(), TrieError> {
        if let Some(ref root) = self.root {
            self.state.commit(root)?;
        }
        Ok(())
    }

    /// Converts the trie into a map of path to value.
    pub fn to_dict(&self) -> Result<BTreeMap<PathRLP, ValueRLP>, TrieError> {
        let mut out = BTreeMap::new();
        if let Some(root) = &self.root {
            self.collect_content(root, Nibbles::default(), &mut out)?;
        }
        Ok(out)
    }

    fn collect_content(
        &self,
        node_hash: &NodeHash,
        path: Nibbles,
        out: &mut BTreeMap<PathRLP, ValueRLP>,
    ) -> Result<(), TrieError> {
        let node = self
            .state
            .get_node(node_hash.clone())?
            .ok_or(TrieError::InconsistentTree)?;
        match node {
            Node::Branch(branch) => {
                if !branch.value.is_empty() {
                    out.insert(path.to_bytes(), branch.value.clone());
                }
                for (choice, child) in branch.choices.iter().enumerate() {
                    if child.is_valid() {
                        self.collect_content(child, path.append_new(choice as u8), out)?;
                    }
                }
            }
            Node::Extension(extension) => {
                let mut path = path;
                path.extend(&extension.prefix);
                self.collect_content(&extension.child, path, out)?;
            }
            Node::Leaf(leaf) => {
                let mut path = path;
                path.extend(&leaf.partial);
                out.insert(path.to_bytes(), leaf.value);
            }
        }
        Ok(())
    }

    /// Returns the smallest stored path strictly greater than the given one.
    /// Paths are ordered as byte strings; the ordering is only meaningful
    /// between equal-length paths, which is all the engine ever stores.
    pub fn next(&self, path: &PathRLP) -> Result<Option<PathRLP>, TrieError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let target = Nibbles::from_raw(path, false);
        self.seek_next(root, Vec::new(), target.as_ref())
    }

    /// Returns the greatest stored path strictly smaller than the given one.
    pub fn prev(&self, path: &PathRLP) -> Result<Option<PathRLP>, TrieError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let target = Nibbles::from_raw(path, false);
        self.seek_prev(root, Vec::new(), target.as_ref())
    }

    fn seek_next(
        &self,
        node_hash: &NodeHash,
        prefix: Vec<u8>,
        target: &[u8],
    ) -> Result<Option<PathRLP>, TrieError> {
        let node = self
            .state
            .get_node(node_hash.clone())?
            .ok_or(TrieError::InconsistentTree)?;
        match node {
            Node::Leaf(leaf) => {
                let mut full = prefix;
                full.extend_from_slice(leaf.partial.without_flag());
                Ok((full.as_slice() > target).then(|| pack_nibbles(&full)))
            }
            Node::Extension(extension) => {
                let mut full = prefix;
                full.extend_from_slice(extension.prefix.as_ref());
                match cmp_to_target(&full, target) {
                    Ordering::Less => Ok(None),
                    Ordering::Greater => self.leftmost(&extension.child, full),
                    Ordering::Equal => self.seek_next(&extension.child, full, target),
                }
            }
            Node::Branch(branch) => {
                if !branch.value.is_empty() && prefix.as_slice() > target {
                    return Ok(Some(pack_nibbles(&prefix)));
                }
                for (choice, child) in branch.choices.iter().enumerate() {
                    if !child.is_valid() {
                        continue;
                    }
                    let mut path = prefix.clone();
                    path.push(choice as u8);
                    let found = match cmp_to_target(&path, target) {
                        Ordering::Less => None,
                        Ordering::Greater => self.leftmost(child, path)?,
                        Ordering::Equal => self.seek_next(child, path, target)?,
                    };
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Ok(None)
            }
        }
    }

    fn seek_prev(
        &self,
        node_hash: &NodeHash,
        prefix: Vec<u8>,
        target: &[u8],
    ) -> Result<Option<PathRLP>, TrieError> {
        let node = self
            .state
            .get_node(node_hash.clone())?
            .ok_or(TrieError::InconsistentTree)?;
        match node {
            Node::Leaf(leaf) => {
                let mut full = prefix;
                full.extend_from_slice(leaf.partial.without_flag());
                Ok((full.as_slice() < target).then(|| pack_nibbles(&full)))
            }
            Node::Extension(extension) => {
                let mut full = prefix;
                full.extend_from_slice(extension.prefix.as_ref());
                match cmp_to_target(&full, target) {
                    Ordering::Greater => Ok(None),
                    Ordering::Less => self.rightmost(&extension.child, full),
                    Ordering::Equal => self.seek_prev(&extension.child, full, target),
                }
            }
            Node::Branch(branch) => {
                for (choice, child) in branch.choices.iter().enumerate().rev() {
                    if !child.is_valid() {
                        continue;
                    }
                    let mut path = prefix.clone();
                    path.push(choice as u8);
                    let found = match cmp_to_target(&path, target) {
                        Ordering::Greater => None,
                        Ordering::Less => self.rightmost(child, path)?,
                        Ordering::Equal => self.seek_prev(child, path, target)?,
                    };
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                // The branch's own value sorts before all of its children
                if !branch.value.is_empty() && prefix.as_slice() < target {
                    return Ok(Some(pack_nibbles(&prefix)));
                }
                Ok(None)
            }
        }
    }

    fn leftmost(
        &self,
        node_hash: &NodeHash,
        prefix: Vec<u8>,
    ) -> Result<Option<PathRLP>, TrieError> {
        let node = self
            .state
            .get_node(node_hash.clone())?
            .ok_or(TrieError::InconsistentTree)?;
        match node {
            Node::Leaf(leaf) => {
                let mut full = prefix;
                full.extend_from_slice(leaf.partial.without_flag());
                Ok(Some(pack_nibbles(&full)))
            }
            Node::Extension(extension) => {
                let mut full = prefix;
                full.extend_from_slice(extension.prefix.as_ref());
                self.leftmost(&extension.child, full)
            }
            Node::Branch(branch) => {
                if !branch.value.is_empty() {
                    return Ok(Some(pack_nibbles(&prefix)));
                }
                for (choice, child) in branch.choices.iter().enumerate() {
                    if child.is_valid() {
                        let mut path = prefix;
                        path.push(choice as u8);
                        return self.leftmost(child, path);
                    }
                }
                Ok(None)
            }
        }
    }

    fn rightmost(
        &self,
        node_hash: &NodeHash,
        prefix: Vec<u8>,
    ) -> Result<Option<PathRLP>, TrieError> {
        let node = self
            .state
            .get_node(node_hash.clone())?
            .ok_or(TrieError::InconsistentTree)?;
        match node {
            Node::Leaf(leaf) => {
                let mut full = prefix;
                full.extend_from_slice(leaf.partial.without_flag());
                Ok(Some(pack_nibbles(&full)))
            }
            Node::Extension(extension) => {
                let mut full = prefix;
                full.extend_from_slice(extension.prefix.as_ref());
                self.rightmost(&extension.child, full)
            }
            Node::Branch(branch) => {
                for (choice, child) in branch.choices.iter().enumerate().rev() {
                    if child.is_valid() {
                        let mut path = prefix;
                        path.push(choice as u8);
                        return self.rightmost(child, path);
                    }
                }
                if !branch.value.is_empty() {
                    return Ok(Some(pack_nibbles(&prefix)));
                }
                Ok(None)
            }
        }
    }

    /// Creates a new Trie based on a temporary InMemory DB
    pub fn new_temp() -> Self {
        Trie::new(Box::new(InMemoryTrieDB::new_empty()))
    }
}

/// Compares a node path against the corresponding prefix of the target path.
/// `Equal` means the node path is a prefix of (or equal to) the target;
/// a node path extending past an exhausted target sorts after it.
fn cmp_to_target(path: &[u8], target: &[u8]) -> Ordering {
    let len = path.len().min(target.len());
    match path[..len].cmp(&target[..len]) {
        Ordering::Equal if path.len() > target.len() => Ordering::Greater,
        other => other,
    }
}

fn pack_nibbles(nibbles: &[u8]) -> Vec<u8> {
    nibbles
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| pair[0] << 4 | pair[1])
        .collect()
}

impl IntoIterator for Trie {
    type Item = (Nibbles, Node);

    type IntoIter = TrieIterator;

    fn into_iter(self) -> Self::IntoIter {
        TrieIterator::new(self)
    }
}
