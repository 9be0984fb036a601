use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// A reference to a trie node.
///
/// Nodes whose RLP encoding is shorter than 32 bytes are not hashed; their raw
/// encoding is embedded in the parent instead, as mandated by the
/// Merkle-Patricia spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeHash {
    Hashed(H256),
    Inline(Vec<u8>),
}

impl NodeHash {
    /// Builds the reference for a node given its RLP encoding.
    pub fn from_encoded_raw(encoded: Vec<u8>) -> NodeHash {
        if encoded.len() >= 32 {
            NodeHash::Hashed(H256::from_slice(&Keccak256::digest(&encoded)))
        } else {
            NodeHash::Inline(encoded)
        }
    }

    /// Returns true if the hash points to a node, false if it is the empty reference.
    pub fn is_valid(&self) -> bool {
        !matches!(self, NodeHash::Inline(encoded) if encoded.is_empty())
    }

    /// Converts the reference into a definite H256, hashing inline nodes.
    /// Used for the root node only, as roots are always addressed by hash.
    pub fn finalize(&self) -> H256 {
        match self {
            NodeHash::Hashed(hash) => *hash,
            NodeHash::Inline(encoded) => H256::from_slice(&Keccak256::digest(encoded)),
        }
    }
}

impl Default for NodeHash {
    fn default() -> Self {
        NodeHash::Inline(Vec::new())
    }
}

impl From<H256> for NodeHash {
    fn from(value: H256) -> Self {
        NodeHash::Hashed(value)
    }
}
