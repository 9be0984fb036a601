use std::collections::HashMap;

use crate::error::TrieError;

use super::db::TrieDB;
use super::{node::Node, node_hash::NodeHash};

// Wraps a mutable hashmap behind a RefCell so reads through a shared
// reference can still populate the cache. Get/set accessors keep the borrow
// scoped to each call, which a panicking RefCell borrow would not.
struct TrieStateCache {
    inner: std::cell::RefCell<HashMap<NodeHash, Node>>,
}

impl TrieStateCache {
    pub fn new_empty() -> Self {
        Self {
            inner: Default::default(),
        }
    }
    pub fn insert(&self, key: NodeHash, value: Node) {
        self.inner.borrow_mut().insert(key, value);
    }
    pub fn get(&self, key: &NodeHash) -> Option<Node> {
        self.inner.borrow().get(key).cloned()
    }
    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }
    pub fn remove(&self, key: &NodeHash) -> Option<Node> {
        self.inner.borrow_mut().remove(key)
    }
}

/// Database representing the trie state.
/// Tracks a table mapping node hashes to rlp encoded nodes; nodes are written
/// through to the backing DB when the trie commits.
pub struct TrieState {
    db: Box<dyn TrieDB>,
    cache: TrieStateCache,
}

impl TrieState {
    /// Creates a TrieState referring to a db.
    pub fn new(db: Box<dyn TrieDB>) -> TrieState {
        TrieState {
            db,
            cache: TrieStateCache::new_empty(),
        }
    }

    /// Retrieves a node based on its hash
    pub fn get_node(&self, hash: NodeHash) -> Result<Option<Node>, TrieError> {
        // Decode the node if it is inlined
        if let NodeHash::Inline(encoded) = &hash {
            if encoded.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Node::decode_raw(encoded)?));
        }
        match self.cache.get(&hash) {
            Some(node) => Ok(Some(node)),
            None => {
                let NodeHash::Hashed(hashed) = &hash else {
                    return Ok(None);
                };
                let Some(db_result) = self
                    .db
                    .get(hashed.as_bytes().to_vec())?
                    .map(|rlp| Node::decode_raw(&rlp).map_err(TrieError::RLPDecode))
                    .transpose()?
                else {
                    return Ok(None);
                };
                self.cache.insert(hash, db_result.clone());
                Ok(Some(db_result))
            }
        }
    }

    /// Inserts a node
    pub fn insert_node(&mut self, node: Node, hash: NodeHash) {
        // Don't insert the node if it is already inlined on the parent
        if matches!(hash, NodeHash::Hashed(_)) {
            self.cache.insert(hash, node);
        }
    }

    /// Commits cache changes to DB and clears it
    /// Only writes nodes that follow the root's canonical trie
    pub fn commit(&mut self, root: &NodeHash) -> Result<(), TrieError> {
        let mut to_commit = Vec::new();
        self.commit_node(root, &mut to_commit)?;
        self.db.put_batch(to_commit)?;
        self.cache.clear();
        Ok(())
    }

    // Writes a node and its children into the accumulator
    fn commit_node(
        &mut self,
        node_hash: &NodeHash,
        acc: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), TrieError> {
        let Some(node) = self.cache.remove(node_hash) else {
            // If the node is not in the cache then it is already stored in the
            // DB, or inlined in its parent
            return Ok(());
        };
        // Commit children (if any)
        match &node {
            Node::Branch(branch) => {
                for child in branch.choices.iter() {
                    if child.is_valid() {
                        self.commit_node(child, acc)?;
                    }
                }
            }
            Node::Extension(extension) => self.commit_node(&extension.child, acc)?,
            Node::Leaf(_) => {}
        }
        // Commit self
        if let NodeHash::Hashed(hash) = node_hash {
            acc.push((hash.as_bytes().to_vec(), node.encode_raw()));
        }
        Ok(())
    }
}
