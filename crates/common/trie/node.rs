use caspra_rlp::{
    decode::{decode_bytes, decode_rlp_item, get_item_with_prefix},
    error::RLPDecodeError,
    structs::Encoder,
};

use crate::{ValueRLP, error::TrieError, nibbles::Nibbles, node_hash::NodeHash, state::TrieState};

/// A node in a Merkle Patricia Trie
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(Box<BranchNode>),
    Extension(ExtensionNode),
    Leaf(LeafNode),
}

/// Branch node: sixteen child references plus the value of the path ending here
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchNode {
    pub choices: [NodeHash; 16],
    pub value: ValueRLP,
}

/// Extension node: a shared nibble prefix compressing a single-child chain
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionNode {
    pub prefix: Nibbles,
    pub child: NodeHash,
}

/// Leaf node: the remaining path (leaf flag included) and the stored value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafNode {
    pub partial: Nibbles,
    pub value: ValueRLP,
}

impl From<BranchNode> for Node {
    fn from(node: BranchNode) -> Self {
        Node::Branch(Box::new(node))
    }
}

impl From<ExtensionNode> for Node {
    fn from(node: ExtensionNode) -> Self {
        Node::Extension(node)
    }
}

impl From<LeafNode> for Node {
    fn from(node: LeafNode) -> Self {
        Node::Leaf(node)
    }
}

impl LeafNode {
    pub fn new(partial: Nibbles, value: ValueRLP) -> Self {
        Self { partial, value }
    }
}

impl ExtensionNode {
    pub fn new(prefix: Nibbles, child: NodeHash) -> Self {
        Self { prefix, child }
    }
}

impl Node {
    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(&self, state: &TrieState, mut path: Nibbles) -> Result<Option<ValueRLP>, TrieError> {
        match self {
            Node::Branch(node) => match path.next_choice() {
                Some(choice) => {
                    let child = &node.choices[choice];
                    if child.is_valid() {
                        let child_node = state
                            .get_node(child.clone())?
                            .ok_or(TrieError::InconsistentTree)?;
                        child_node.get(state, path)
                    } else {
                        Ok(None)
                    }
                }
                None => Ok((!node.value.is_empty()).then(|| node.value.clone())),
            },
            Node::Extension(node) => {
                if path.skip_prefix(&node.prefix) {
                    let child_node = state
                        .get_node(node.child.clone())?
                        .ok_or(TrieError::InconsistentTree)?;
                    child_node.get(state, path)
                } else {
                    Ok(None)
                }
            }
            Node::Leaf(node) => Ok((path == node.partial).then(|| node.value.clone())),
        }
    }

    /// Inserts a value into the subtrie originating from this node and returns the new root of the subtrie
    pub fn insert(
        self,
        state: &mut TrieState,
        path: Nibbles,
        value: ValueRLP,
    ) -> Result<Node, TrieError> {
        match self {
            Node::Branch(node) => node.insert(state, path, value),
            Node::Extension(node) => node.insert(state, path, value),
            Node::Leaf(node) => node.insert(state, path, value),
        }
    }

    /// Removes a value from the subtrie originating from this node given its path.
    /// Returns the new root of the subtrie (or None if this subtrie became empty)
    /// and the removed value if it existed.
    pub fn remove(
        self,
        state: &mut TrieState,
        path: Nibbles,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        match self {
            Node::Branch(node) => node.remove(state, path),
            Node::Extension(node) => node.remove(state, path),
            Node::Leaf(node) => Ok(node.remove(path)),
        }
    }

    /// Computes the node's reference and registers hashed nodes into the trie state.
    pub fn insert_self(self, state: &mut TrieState) -> Result<NodeHash, TrieError> {
        let hash = NodeHash::from_encoded_raw(self.encode_raw());
        state.insert_node(self, hash.clone());
        Ok(hash)
    }

    /// Computes the node's reference without touching the trie state.
    pub fn compute_hash(&self) -> NodeHash {
        NodeHash::from_encoded_raw(self.encode_raw())
    }

    /// Canonical RLP encoding used for hash computation and storage.
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Node::Branch(node) => {
                let mut encoder = Encoder::new(&mut buf);
                for child in node.choices.iter() {
                    encoder = encode_child(encoder, child);
                }
                encoder.encode_bytes(&node.value).finish();
            }
            Node::Extension(node) => {
                let encoder = Encoder::new(&mut buf).encode_bytes(&node.prefix.encode_compact());
                encode_child(encoder, &node.child).finish();
            }
            Node::Leaf(node) => {
                Encoder::new(&mut buf)
                    .encode_bytes(&node.partial.encode_compact())
                    .encode_bytes(&node.value)
                    .finish();
            }
        }
        buf
    }

    /// Decodes a node from its canonical RLP encoding.
    pub fn decode_raw(rlp: &[u8]) -> Result<Node, RLPDecodeError> {
        let (is_list, mut payload, _) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let mut items = Vec::new();
        while !payload.is_empty() {
            let (item, rest) = get_item_with_prefix(payload)?;
            items.push(item);
            payload = rest;
        }
        match items.len() {
            2 => {
                let (compact, _) = decode_bytes(items[0])?;
                let partial = Nibbles::decode_compact(compact);
                if partial.is_leaf() {
                    let (value, _) = decode_bytes(items[1])?;
                    Ok(LeafNode::new(partial, value.to_vec()).into())
                } else {
                    let child = decode_child(items[1])?;
                    Ok(ExtensionNode::new(partial, child).into())
                }
            }
            17 => {
                let mut node = BranchNode::default();
                for (choice, item) in items[..16].iter().enumerate() {
                    node.choices[choice] = decode_child(item)?;
                }
                let (value, _) = decode_bytes(items[16])?;
                node.value = value.to_vec();
                Ok(node.into())
            }
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

/// Encodes a child reference: hashed children as 32-byte strings, inline
/// children spliced in raw, absent children as the empty string.
fn encode_child<'a>(encoder: Encoder<'a>, child: &NodeHash) -> Encoder<'a> {
    match child {
        NodeHash::Hashed(hash) => encoder.encode_bytes(hash.as_bytes()),
        NodeHash::Inline(raw) if !raw.is_empty() => encoder.encode_raw(raw),
        NodeHash::Inline(_) => encoder.encode_bytes(&[]),
    }
}

fn decode_child(rlp: &[u8]) -> Result<NodeHash, RLPDecodeError> {
    match decode_rlp_item(rlp)? {
        (true, _, _) => Ok(NodeHash::Inline(rlp.to_vec())),
        (false, payload, _) if payload.is_empty() => Ok(NodeHash::default()),
        (false, payload, _) if payload.len() == 32 => {
            Ok(NodeHash::Hashed(ethereum_types::H256::from_slice(payload)))
        }
        _ => Err(RLPDecodeError::MalformedData),
    }
}

impl LeafNode {
    fn insert(self, state: &mut TrieState, path: Nibbles, value: ValueRLP) -> Result<Node, TrieError> {
        if path == self.partial {
            return Ok(LeafNode::new(path, value).into());
        }
        // Split into a branch at the divergence point; both suffixes are
        // non-empty because well-formed paths only carry the 16 flag at the end.
        let match_len = path.count_prefix(&self.partial);
        let self_suffix = self.partial.offset(match_len);
        let path_suffix = path.offset(match_len);
        let mut branch = BranchNode::default();
        match self_suffix.at(0) {
            16 => branch.value = self.value,
            choice => {
                let leaf = LeafNode::new(self_suffix.offset(1), self.value);
                branch.choices[choice] = Node::from(leaf).insert_self(state)?;
            }
        }
        match path_suffix.at(0) {
            16 => branch.value = value,
            choice => {
                let leaf = LeafNode::new(path_suffix.offset(1), value);
                branch.choices[choice] = Node::from(leaf).insert_self(state)?;
            }
        }
        let branch_node = Node::from(branch);
        if match_len == 0 {
            Ok(branch_node)
        } else {
            let child = branch_node.insert_self(state)?;
            Ok(ExtensionNode::new(path.slice(0, match_len), child).into())
        }
    }

    fn remove(self, path: Nibbles) -> (Option<Node>, Option<ValueRLP>) {
        if path == self.partial {
            (None, Some(self.value))
        } else {
            (Some(self.into()), None)
        }
    }
}

impl ExtensionNode {
    fn insert(self, state: &mut TrieState, path: Nibbles, value: ValueRLP) -> Result<Node, TrieError> {
        let match_len = path.count_prefix(&self.prefix);
        if match_len == self.prefix.len() {
            // The path continues below our child
            let child_node = state
                .get_node(self.child)?
                .ok_or(TrieError::InconsistentTree)?;
            let new_child = child_node.insert(state, path.offset(match_len), value)?;
            let child_ref = new_child.insert_self(state)?;
            return Ok(ExtensionNode::new(self.prefix, child_ref).into());
        }
        // Split the prefix at the divergence point
        let prefix_suffix = self.prefix.offset(match_len);
        let path_suffix = path.offset(match_len);
        let mut branch = BranchNode::default();
        let choice = prefix_suffix.at(0);
        branch.choices[choice] = if prefix_suffix.len() == 1 {
            self.child
        } else {
            Node::from(ExtensionNode::new(prefix_suffix.offset(1), self.child)).insert_self(state)?
        };
        match path_suffix.at(0) {
            16 => branch.value = value,
            choice => {
                let leaf = LeafNode::new(path_suffix.offset(1), value);
                branch.choices[choice] = Node::from(leaf).insert_self(state)?;
            }
        }
        let branch_node = Node::from(branch);
        if match_len == 0 {
            Ok(branch_node)
        } else {
            let child = branch_node.insert_self(state)?;
            Ok(ExtensionNode::new(self.prefix.slice(0, match_len), child).into())
        }
    }

    fn remove(
        self,
        state: &mut TrieState,
        mut path: Nibbles,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        if !path.skip_prefix(&self.prefix) {
            return Ok((Some(self.into()), None));
        }
        let child_node = state
            .get_node(self.child)?
            .ok_or(TrieError::InconsistentTree)?;
        let (new_child, old_value) = child_node.remove(state, path)?;
        // A single-child extension is re-fused with whatever its child collapsed into
        let node = match new_child {
            None => None,
            Some(Node::Leaf(leaf)) => {
                let mut partial = self.prefix;
                partial.extend(&leaf.partial);
                Some(LeafNode::new(partial, leaf.value).into())
            }
            Some(Node::Extension(extension)) => {
                let mut prefix = self.prefix;
                prefix.extend(&extension.prefix);
                Some(ExtensionNode::new(prefix, extension.child).into())
            }
            Some(branch @ Node::Branch(_)) => {
                let child_ref = branch.insert_self(state)?;
                Some(ExtensionNode::new(self.prefix, child_ref).into())
            }
        };
        Ok((node, old_value))
    }
}

impl BranchNode {
    fn insert(
        mut self,
        state: &mut TrieState,
        mut path: Nibbles,
        value: ValueRLP,
    ) -> Result<Node, TrieError> {
        match path.next_choice() {
            Some(choice) => {
                if self.choices[choice].is_valid() {
                    let child_node = state
                        .get_node(self.choices[choice].clone())?
                        .ok_or(TrieError::InconsistentTree)?;
                    let new_child = child_node.insert(state, path, value)?;
                    self.choices[choice] = new_child.insert_self(state)?;
                } else {
                    let leaf = LeafNode::new(path, value);
                    self.choices[choice] = Node::from(leaf).insert_self(state)?;
                }
            }
            None => self.value = value,
        }
        Ok(self.into())
    }

    fn remove(
        mut self,
        state: &mut TrieState,
        mut path: Nibbles,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        let old_value = match path.next_choice() {
            Some(choice) if self.choices[choice].is_valid() => {
                let child_node = state
                    .get_node(self.choices[choice].clone())?
                    .ok_or(TrieError::InconsistentTree)?;
                let (new_child, old_value) = child_node.remove(state, path)?;
                self.choices[choice] = match new_child {
                    Some(node) => node.insert_self(state)?,
                    None => NodeHash::default(),
                };
                old_value
            }
            Some(_) => None,
            None => {
                if self.value.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.value))
                }
            }
        };

        // A branch with a single remaining reference degrades into a
        // leaf or extension carrying the choice nibble
        let choice_count: Vec<usize> = (0..16).filter(|i| self.choices[*i].is_valid()).collect();
        let node = match (choice_count.as_slice(), self.value.is_empty()) {
            ([], true) => None,
            ([], false) => Some(
                LeafNode::new(Nibbles::from_hex(vec![16]), std::mem::take(&mut self.value)).into(),
            ),
            ([choice], true) => {
                let child_node = state
                    .get_node(self.choices[*choice].clone())?
                    .ok_or(TrieError::InconsistentTree)?;
                Some(match child_node {
                    Node::Leaf(leaf) => {
                        let mut partial = Nibbles::from_hex(vec![*choice as u8]);
                        partial.extend(&leaf.partial);
                        LeafNode::new(partial, leaf.value).into()
                    }
                    Node::Extension(extension) => {
                        let mut prefix = Nibbles::from_hex(vec![*choice as u8]);
                        prefix.extend(&extension.prefix);
                        ExtensionNode::new(prefix, extension.child).into()
                    }
                    Node::Branch(_) => ExtensionNode::new(
                        Nibbles::from_hex(vec![*choice as u8]),
                        self.choices[*choice].clone(),
                    )
                    .into(),
                })
            }
            _ => Some(self.into()),
        };
        Ok((node, old_value))
    }
}
