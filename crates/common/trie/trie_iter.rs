use crate::{PathRLP, Trie, ValueRLP, nibbles::Nibbles, node::Node, node_hash::NodeHash};

pub struct TrieIterator {
    trie: Trie,
    // The stack contains the current traversed path and the next node to be traversed.
    // Elements are pushed in reverse choice order so the smallest path is popped first.
    stack: Vec<(Nibbles, NodeHash)>,
}

impl TrieIterator {
    pub(crate) fn new(trie: Trie) -> Self {
        let mut stack = Vec::new();
        if let Some(root) = trie.root.clone() {
            stack.push((Nibbles::default(), root));
        }
        Self { trie, stack }
    }
}

impl Iterator for TrieIterator {
    type Item = (Nibbles, Node);

    fn next(&mut self) -> Option<Self::Item> {
        // Fetch the last node in the stack
        let (mut path, next_node_hash) = self.stack.pop()?;
        let next_node = self.trie.state.get_node(next_node_hash).ok().flatten()?;
        match &next_node {
            Node::Branch(branch_node) => {
                // Add all children to the stack (in reverse order so we process the first child first)
                for (choice, child) in branch_node.choices.iter().enumerate().rev() {
                    if child.is_valid() {
                        self.stack.push((path.append_new(choice as u8), child.clone()));
                    }
                }
            }
            Node::Extension(extension_node) => {
                // Update path
                path.extend(&extension_node.prefix);
                // Add child to the stack
                self.stack
                    .push((path.clone(), extension_node.child.clone()));
            }
            Node::Leaf(leaf) => {
                path.extend(&leaf.partial);
            }
        }
        Some((path, next_node))
    }
}

impl TrieIterator {
    pub fn content(self) -> impl Iterator<Item = (PathRLP, ValueRLP)> {
        self.filter_map(|(path, node)| match node {
            Node::Branch(branch_node) => {
                (!branch_node.value.is_empty()).then(|| (path.to_bytes(), branch_node.value))
            }
            Node::Extension(_) => None,
            Node::Leaf(leaf_node) => Some((path.to_bytes(), leaf_node.value)),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::Trie;

    #[test]
    fn trie_iter_content() {
        let expected_content = vec![
            (vec![0, 9], vec![3, 4]),
            (vec![1, 2], vec![5, 6]),
            (vec![2, 7], vec![7, 8]),
        ];
        let mut trie = Trie::new_temp();
        for (path, value) in expected_content.clone() {
            trie.insert(path, value).unwrap()
        }
        let content = trie.into_iter().content().collect::<Vec<_>>();
        assert_eq!(content, expected_content);
    }
}
