// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::ciphersuite::CipherSuiteError;
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::crypto::x25519::PublicKey;
use crate::leaf_node::LeafNode;
use crate::tree::TreeReader;
use crate::tree::diff::{StagedDiff, TreeDiff};
use crate::tree::math::{self, LeafIndex, ParentIndex, TreeMathError};

/// An interior tree node holding a shared HPKE public key for its subtree.
///
/// The parent hash chains the node to the next non-blank node above it; the unmerged-leaves
/// list records leaves that joined below this node since its key was last refreshed and whose
/// own keys therefore have to be addressed separately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentNode {
    pub(crate) encryption_key: PublicKey,
    pub(crate) parent_hash: Vec<u8>,
    pub(crate) unmerged_leaves: Vec<LeafIndex>,
}

impl ParentNode {
    pub fn encryption_key(&self) -> &PublicKey {
        &self.encryption_key
    }

    pub fn unmerged_leaves(&self) -> &[LeafIndex] {
        &self.unmerged_leaves
    }

    /// Record a leaf that joined below this node, keeping the list sorted.
    pub(crate) fn add_unmerged_leaf(&mut self, leaf: LeafIndex) {
        if let Err(position) = self.unmerged_leaves.binary_search(&leaf) {
            self.unmerged_leaves.insert(position, leaf);
        }
    }
}

impl Encode for ParentNode {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, self.encryption_key.as_bytes())?;
        encode_var_bytes(buffer, VarWidth::U8, &self.parent_hash)?;
        self.unmerged_leaves.encode(buffer)
    }
}

impl Decode for ParentNode {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let encryption_key = decode_var_bytes(cursor, VarWidth::U8)?;
        let parent_hash = decode_var_bytes(cursor, VarWidth::U8)?;
        let unmerged_leaves = Vec::decode(cursor)?;
        Ok(Self {
            encryption_key: PublicKey::from_bytes(
                encryption_key
                    .try_into()
                    .map_err(|_| CodecError::InvalidLength)?,
            ),
            parent_hash,
            unmerged_leaves,
        })
    }
}

/// A node as it travels on the wire inside a ratchet-tree extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Parent(ParentNode),
}

impl Encode for Node {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Node::Leaf(leaf) => {
                1u8.encode(buffer)?;
                leaf.encode(buffer)
            }
            Node::Parent(parent) => {
                2u8.encode(buffer)?;
                parent.encode(buffer)
            }
        }
    }
}

impl Decode for Node {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match u8::decode(cursor)? {
            1 => Ok(Node::Leaf(LeafNode::decode(cursor)?)),
            2 => Ok(Node::Parent(ParentNode::decode(cursor)?)),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

/// The ratchet tree: `2n - 1` array positions for a leaf capacity of `n`, even positions holding
/// optional leaves and odd positions optional parents. Absence denotes a blank node.
///
/// The capacity is always a power of two. It only changes through a staged diff, and every
/// structural edit goes through [`RatchetTree::diff`] followed by an atomic
/// [`RatchetTree::merge`]; outstanding diffs borrow the tree, so the tree is immutable for their
/// lifetime. A merge invalidates any diff staged from an earlier state of the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetTree {
    leaves: Vec<Option<LeafNode>>,
    parents: Vec<Option<ParentNode>>,
    version: u64,
}

impl RatchetTree {
    /// A one-leaf tree holding the founder.
    pub fn new(leaf: LeafNode) -> Self {
        Self {
            leaves: vec![Some(leaf)],
            parents: Vec::new(),
            version: 0,
        }
    }

    /// Import a tree from its wire representation (welcome processing).
    pub fn from_nodes(nodes: Vec<Option<Node>>) -> Result<Self, TreeError> {
        if nodes.is_empty() || nodes.len() % 2 == 0 || !(nodes.len() + 1).is_power_of_two() {
            return Err(TreeError::MalformedNodeList);
        }

        let mut leaves = Vec::with_capacity((nodes.len() + 1) / 2);
        let mut parents = Vec::with_capacity(nodes.len() / 2);
        for (index, node) in nodes.into_iter().enumerate() {
            match (index % 2, node) {
                (0, None) => leaves.push(None),
                (0, Some(Node::Leaf(leaf))) => leaves.push(Some(leaf)),
                (1, None) => parents.push(None),
                (1, Some(Node::Parent(parent))) => parents.push(Some(parent)),
                _ => return Err(TreeError::MalformedNodeList),
            }
        }

        Ok(Self {
            leaves,
            parents,
            version: 0,
        })
    }

    /// Export the tree into its wire representation (ratchet-tree extension).
    pub fn to_nodes(&self) -> Vec<Option<Node>> {
        let mut nodes = Vec::with_capacity(self.size() as usize);
        for index in 0..self.size() {
            if index % 2 == 0 {
                nodes.push(
                    self.leaves[(index / 2) as usize]
                        .clone()
                        .map(Node::Leaf),
                );
            } else {
                nodes.push(
                    self.parents[((index - 1) / 2) as usize]
                        .clone()
                        .map(Node::Parent),
                );
            }
        }
        nodes
    }

    /// Number of array positions.
    pub fn size(&self) -> u32 {
        math::tree_size(self.leaf_count())
    }

    /// Open a staging object for structural edits. The tree is borrowed until the diff is
    /// staged or dropped.
    pub fn diff(&self) -> TreeDiff<'_> {
        TreeDiff::new(self, self.version)
    }

    /// Atomically install a staged diff.
    ///
    /// Fails with [`TreeError::StaleDiff`] if another diff has been merged since this one was
    /// opened; in that case (and on any other failure) the tree is left untouched.
    pub fn merge(&mut self, staged: StagedDiff) -> Result<(), TreeError> {
        if staged.version() != self.version {
            return Err(TreeError::StaleDiff);
        }

        let leaf_count = staged.leaf_count();
        debug_assert!(leaf_count.is_power_of_two());

        // Validate every pending write before mutating anything.
        for index in staged.leaf_keys() {
            if index >= leaf_count {
                return Err(TreeError::IndexOutOfRange);
            }
        }
        for slot in staged.parent_keys() {
            if slot >= (leaf_count - 1) as usize {
                return Err(TreeError::IndexOutOfRange);
            }
        }

        self.leaves.resize(leaf_count as usize, None);
        self.parents.resize((leaf_count - 1) as usize, None);

        let (leaves, parents) = staged.into_pending();
        for (index, leaf) in leaves {
            self.leaves[index as usize] = leaf;
        }
        for (slot, parent) in parents {
            self.parents[slot] = parent;
        }

        self.version += 1;
        Ok(())
    }
}

impl TreeReader for RatchetTree {
    fn leaf_count(&self) -> u32 {
        self.leaves.len() as u32
    }

    fn leaf(&self, index: LeafIndex) -> Option<&LeafNode> {
        self.leaves.get(index.usize())?.as_ref()
    }

    fn parent(&self, index: ParentIndex) -> Option<&ParentNode> {
        self.parents.get(index.slot())?.as_ref()
    }
}

impl Encode for RatchetTree {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.to_nodes().encode(buffer)
    }
}

impl Decode for RatchetTree {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let nodes: Vec<Option<Node>> = Vec::decode(cursor)?;
        RatchetTree::from_nodes(nodes).map_err(|_| CodecError::InvalidLength)
    }
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("upper half of the leaves is not blank")]
    NotShrinkable,

    #[error("diff was staged from an older tree state")]
    StaleDiff,

    #[error("node index lies outside the tree")]
    IndexOutOfRange,

    #[error("node list is not a valid tree encoding")]
    MalformedNodeList,

    #[error(transparent)]
    Math(#[from] TreeMathError),

    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use crate::ciphersuite::CipherSuite;
    use crate::codec::{Decode, Encode};
    use crate::crypto::Rng;
    use crate::leaf_node::LeafNode;
    use crate::test_utils::leaf_with_keys;
    use crate::tree::TreeReader;
    use crate::tree::math::{LeafIndex, NodeIndex, ParentIndex};

    use super::{RatchetTree, TreeError};

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    fn test_leaf(rng: &Rng, identity: &[u8]) -> LeafNode {
        leaf_with_keys(SUITE, identity, rng).0
    }

    #[test]
    fn grow_preserves_contents() {
        let rng = Rng::from_seed([1; 32]);
        let founder = test_leaf(&rng, b"founder");
        let mut tree = RatchetTree::new(founder.clone());
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.size(), 1);

        let mut diff = tree.diff();
        diff.grow();
        diff.grow();
        let staged = diff.stage();
        tree.merge(staged).unwrap();

        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.size(), 7);
        assert_eq!(tree.leaf(LeafIndex::new(0)), Some(&founder));
        assert_eq!(tree.leaf(LeafIndex::new(3)), None);
    }

    #[test]
    fn shrink_requires_blank_upper_half(){
        let rng = Rng::from_seed([2; 32]);
        let mut tree = RatchetTree::new(test_leaf(&rng, b"founder"));

        let mut diff = tree.diff();
        diff.grow();
        diff.replace_leaf(LeafIndex::new(1), test_leaf(&rng, b"second"))
            .unwrap();
        tree.merge(diff.stage()).unwrap();

        // Occupied upper half refuses to shrink.
        let mut diff = tree.diff();
        assert!(matches!(diff.shrink(), Err(TreeError::NotShrinkable)));
        drop(diff);

        // After blanking it shrinks back to one leaf.
        let mut diff = tree.diff();
        diff.blank_leaf(LeafIndex::new(1)).unwrap();
        diff.shrink().unwrap();
        tree.merge(diff.stage()).unwrap();
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn stale_diff_rejected_and_tree_unchanged() {
        let rng = Rng::from_seed([3; 32]);
        let mut tree = RatchetTree::new(test_leaf(&rng, b"founder"));

        let mut diff_1 = tree.diff();
        diff_1.grow();
        let staged_1 = diff_1.stage();

        let mut diff_2 = tree.diff();
        diff_2.grow();
        diff_2.grow();
        let staged_2 = diff_2.stage();

        tree.merge(staged_1).unwrap();
        let snapshot = tree.clone();

        // The second diff was opened against the old version.
        assert!(matches!(tree.merge(staged_2), Err(TreeError::StaleDiff)));
        assert_eq!(tree, snapshot);
    }

    #[test]
    fn blank_path_blanks_every_ancestor() {
        let rng = Rng::from_seed([4; 32]);
        let mut tree = RatchetTree::new(test_leaf(&rng, b"founder"));

        let mut diff = tree.diff();
        diff.grow();
        diff.grow();
        for i in 1..4 {
            diff.replace_leaf(LeafIndex::new(i), test_leaf(&rng, b"member"))
                .unwrap();
        }
        tree.merge(diff.stage()).unwrap();

        let mut diff = tree.diff();
        diff.blank_leaf(LeafIndex::new(0)).unwrap();
        diff.blank_path(LeafIndex::new(0)).unwrap();
        tree.merge(diff.stage()).unwrap();

        assert!(tree.leaf(LeafIndex::new(0)).is_none());
        assert!(
            tree.parent(ParentIndex::try_from(NodeIndex::from_node_index(1)).unwrap())
                .is_none()
        );
        assert!(
            tree.parent(ParentIndex::try_from(NodeIndex::from_node_index(3)).unwrap())
                .is_none()
        );
        assert_eq!(tree.size(), 7);
    }

    #[test]
    fn wire_round_trip() {
        let rng = Rng::from_seed([5; 32]);
        let mut tree = RatchetTree::new(test_leaf(&rng, b"founder"));
        let mut diff = tree.diff();
        diff.grow();
        diff.replace_leaf(LeafIndex::new(1), test_leaf(&rng, b"second"))
            .unwrap();
        tree.merge(diff.stage()).unwrap();

        let bytes = tree.to_bytes().unwrap();
        let decoded = RatchetTree::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.to_nodes(), tree.to_nodes());
    }
}
