// SPDX-License-Identifier: MIT OR Apache-2.0

//! Index algebra over the left-balanced binary tree.
//!
//! Nodes are addressed by a single `u32` index over an array of `2n - 1` positions for `n`
//! leaves. Even indices are leaves, odd indices are parents. All functions here are pure and
//! allocation-free apart from the path builders.
//!
//! ```plain
//!           3
//!         /   \
//!        1     5
//!       / \   / \
//!      0   2 4   6
//! ```
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{CodecError, Cursor, Decode, Encode};

/// Position of a leaf, counted in leaves (`0, 1, 2, ...`), i.e. half its node index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeafIndex(u32);

impl LeafIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn usize(&self) -> usize {
        self.0 as usize
    }

    /// Index of this leaf in the node array.
    pub fn node_index(&self) -> u32 {
        self.0 * 2
    }
}

impl Encode for LeafIndex {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.0.encode(buffer)
    }
}

impl Decode for LeafIndex {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self(u32::decode(cursor)?))
    }
}

/// Index of a parent node in the node array; always odd.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentIndex(u32);

impl ParentIndex {
    pub fn node_index(&self) -> u32 {
        self.0
    }

    /// Position of this parent in dense parent-only storage.
    pub(crate) fn slot(&self) -> usize {
        (self.0 as usize - 1) / 2
    }
}

/// Tagged node index preventing cross-category confusion between leaves and parents.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeIndex {
    Leaf(LeafIndex),
    Parent(ParentIndex),
}

impl NodeIndex {
    /// Classify a raw array index by parity.
    pub fn from_node_index(index: u32) -> Self {
        if index % 2 == 0 {
            NodeIndex::Leaf(LeafIndex(index / 2))
        } else {
            NodeIndex::Parent(ParentIndex(index))
        }
    }

    pub fn node_index(&self) -> u32 {
        match self {
            NodeIndex::Leaf(leaf) => leaf.node_index(),
            NodeIndex::Parent(parent) => parent.node_index(),
        }
    }
}

impl From<LeafIndex> for NodeIndex {
    fn from(leaf: LeafIndex) -> Self {
        NodeIndex::Leaf(leaf)
    }
}

impl From<ParentIndex> for NodeIndex {
    fn from(parent: ParentIndex) -> Self {
        NodeIndex::Parent(parent)
    }
}

impl TryFrom<NodeIndex> for ParentIndex {
    type Error = TreeMathError;

    fn try_from(index: NodeIndex) -> Result<Self, Self::Error> {
        match index {
            NodeIndex::Parent(parent) => Ok(parent),
            NodeIndex::Leaf(_) => Err(TreeMathError::NotAParent),
        }
    }
}

/// Number of array positions of a tree with `n_leaves` leaves. Undefined for zero leaves.
pub fn tree_size(n_leaves: u32) -> u32 {
    2 * n_leaves - 1
}

/// Level of a node: leaves are at level 0, a parent is one level above its highest child.
///
/// In the array representation the level is the number of trailing one-bits of the index.
pub fn level(node_index: u32) -> u32 {
    node_index.trailing_ones()
}

fn log2(x: u32) -> u32 {
    31 - x.leading_zeros()
}

/// Index of the root node. For a one-leaf tree the lone leaf is the root.
pub fn root(n_leaves: u32) -> NodeIndex {
    NodeIndex::from_node_index((1 << log2(tree_size(n_leaves))) - 1)
}

/// Left child of a parent node.
pub fn left(parent: ParentIndex) -> NodeIndex {
    let x = parent.node_index();
    NodeIndex::from_node_index(x ^ (0b01 << (level(x) - 1)))
}

/// Right child of a parent node, stepping down to the left while the nominal child falls outside
/// the tree (left-balancing).
pub fn right(parent: ParentIndex, n_leaves: u32) -> NodeIndex {
    let width = tree_size(n_leaves);
    let x = parent.node_index();
    let mut r = x ^ (0b11 << (level(x) - 1));
    while r >= width {
        r = left(ParentIndex(r)).node_index();
    }
    NodeIndex::from_node_index(r)
}

fn parent_step(x: u32) -> u32 {
    let k = level(x);
    let b = (x >> (k + 1)) & 1;
    (x | (1 << k)) ^ (b << (k + 1))
}

/// Parent of a non-root node.
pub fn parent(index: NodeIndex, n_leaves: u32) -> Result<ParentIndex, TreeMathError> {
    let width = tree_size(n_leaves);
    let x = index.node_index();
    if x >= width {
        return Err(TreeMathError::IndexOutOfRange);
    }
    if x == root(n_leaves).node_index() {
        return Err(TreeMathError::IsRoot);
    }
    let mut p = parent_step(x);
    while p >= width {
        p = parent_step(p);
    }
    Ok(ParentIndex(p))
}

/// The other child of a node's parent.
pub fn sibling(index: NodeIndex, n_leaves: u32) -> Result<NodeIndex, TreeMathError> {
    let p = parent(index, n_leaves)?;
    if index.node_index() < p.node_index() {
        Ok(right(p, n_leaves))
    } else {
        Ok(left(p))
    }
}

/// Ascending sequence of ancestors of a leaf, from its parent up to and including the root.
///
/// Empty when the leaf itself is the root (one-leaf tree).
pub fn direct_path(leaf: LeafIndex, n_leaves: u32) -> Result<Vec<ParentIndex>, TreeMathError> {
    let root_index = root(n_leaves).node_index();
    let mut x = leaf.node_index();
    if x >= tree_size(n_leaves) {
        return Err(TreeMathError::IndexOutOfRange);
    }

    let mut path = Vec::new();
    while x != root_index {
        let p = parent(NodeIndex::from_node_index(x), n_leaves)?;
        path.push(p);
        x = p.node_index();
    }
    Ok(path)
}

/// Sibling of the leaf and of each direct-path node below the root; same length as the direct
/// path.
pub fn copath(leaf: LeafIndex, n_leaves: u32) -> Result<Vec<NodeIndex>, TreeMathError> {
    let root_index = root(n_leaves).node_index();
    let mut x = NodeIndex::from(leaf);
    if x.node_index() >= tree_size(n_leaves) {
        return Err(TreeMathError::IndexOutOfRange);
    }

    let mut path = Vec::new();
    while x.node_index() != root_index {
        path.push(sibling(x, n_leaves)?);
        x = NodeIndex::from(parent(x, n_leaves)?);
    }
    Ok(path)
}

/// Returns true if `descendant` lies in the subtree rooted at `ancestor` (a node is its own
/// ancestor).
pub(crate) fn is_ancestor(ancestor: NodeIndex, descendant: NodeIndex) -> bool {
    let a = ancestor.node_index();
    let d = descendant.node_index();
    let span = (1 << level(a)) - 1;
    a - span <= d && d <= a + span
}

/// Lowest common ancestor of two distinct leaves.
pub(crate) fn lowest_common_ancestor(
    a: LeafIndex,
    b: LeafIndex,
    n_leaves: u32,
) -> Result<ParentIndex, TreeMathError> {
    for candidate in direct_path(a, n_leaves)? {
        if is_ancestor(candidate.into(), b.into()) {
            return Ok(candidate);
        }
    }
    Err(TreeMathError::IndexOutOfRange)
}

/// All leaves in the subtree rooted at the given node.
pub(crate) fn subtree_leaves(index: NodeIndex, n_leaves: u32) -> Vec<LeafIndex> {
    let x = index.node_index();
    let span = (1 << level(x)) - 1;
    let lo = x - span;
    let hi = (x + span).min(tree_size(n_leaves) - 1);
    (lo..=hi)
        .filter(|i| i % 2 == 0)
        .map(|i| LeafIndex(i / 2))
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeMathError {
    #[error("node is a leaf, not a parent")]
    NotAParent,

    #[error("the root node has no parent")]
    IsRoot,

    #[error("node index lies outside the tree")]
    IndexOutOfRange,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        LeafIndex, NodeIndex, ParentIndex, TreeMathError, copath, direct_path, left, level,
        lowest_common_ancestor, parent, right, root, sibling, subtree_leaves, tree_size,
    };

    #[test]
    fn four_leaf_tree() {
        // Seven nodes indexed 0..6.
        assert_eq!(tree_size(4), 7);
        assert_eq!(root(4).node_index(), 3);
        assert_eq!(level(3), 2);

        let paths: Vec<u32> = direct_path(LeafIndex::new(0), 4)
            .unwrap()
            .iter()
            .map(|p| p.node_index())
            .collect();
        assert_eq!(paths, vec![1, 3]);

        let copaths: Vec<u32> = copath(LeafIndex::new(0), 4)
            .unwrap()
            .iter()
            .map(|p| p.node_index())
            .collect();
        assert_eq!(copaths, vec![2, 5]);

        assert_eq!(
            sibling(NodeIndex::from(LeafIndex::new(0)), 4)
                .unwrap()
                .node_index(),
            2
        );
    }

    #[test]
    fn one_leaf_tree() {
        // The lone leaf is the root.
        assert_eq!(tree_size(1), 1);
        assert_eq!(root(1).node_index(), 0);
        assert!(direct_path(LeafIndex::new(0), 1).unwrap().is_empty());
        assert!(copath(LeafIndex::new(0), 1).unwrap().is_empty());
        assert_eq!(
            parent(NodeIndex::from(LeafIndex::new(0)), 1),
            Err(TreeMathError::IsRoot)
        );
    }

    #[test]
    fn leaf_is_not_a_parent() {
        assert_eq!(
            ParentIndex::try_from(NodeIndex::from(LeafIndex::new(2))),
            Err(TreeMathError::NotAParent)
        );
    }

    #[test]
    fn out_of_range() {
        assert_eq!(
            parent(NodeIndex::from_node_index(7), 4),
            Err(TreeMathError::IndexOutOfRange)
        );
        assert_eq!(
            direct_path(LeafIndex::new(4), 4),
            Err(TreeMathError::IndexOutOfRange)
        );
    }

    #[test]
    fn lowest_common_ancestors() {
        assert_eq!(
            lowest_common_ancestor(LeafIndex::new(0), LeafIndex::new(1), 4)
                .unwrap()
                .node_index(),
            1
        );
        assert_eq!(
            lowest_common_ancestor(LeafIndex::new(0), LeafIndex::new(3), 4)
                .unwrap()
                .node_index(),
            3
        );
    }

    #[test]
    fn subtree_leaf_sets() {
        let leaves: Vec<u32> = subtree_leaves(NodeIndex::from_node_index(5), 4)
            .iter()
            .map(|leaf| leaf.u32())
            .collect();
        assert_eq!(leaves, vec![2, 3]);

        let leaves: Vec<u32> = subtree_leaves(root(4), 4)
            .iter()
            .map(|leaf| leaf.u32())
            .collect();
        assert_eq!(leaves, vec![0, 1, 2, 3]);
    }

    proptest! {
        #[test]
        fn size_and_root(n_leaves in 1u32..1024) {
            prop_assert_eq!(tree_size(n_leaves), 2 * n_leaves - 1);

            // root(n) = 2^(ceil(log2(n))) - 1 for any power-of-two capacity.
            if n_leaves.is_power_of_two() {
                prop_assert_eq!(root(n_leaves).node_index(), n_leaves - 1);
            }
        }

        #[test]
        fn children_share_their_parent(n_leaves in 2u32..256, index in 0u32..65536) {
            let index = index % tree_size(n_leaves);
            let node = NodeIndex::from_node_index(index);
            if let Ok(p) = parent(node, n_leaves) {
                prop_assert_eq!(parent(left(p), n_leaves).unwrap(), p);
                prop_assert_eq!(parent(right(p, n_leaves), n_leaves).unwrap(), p);
            }
        }

        #[test]
        fn paths_have_equal_length(n_leaves in 1u32..256, leaf in 0u32..256) {
            let leaf = LeafIndex::new(leaf % n_leaves);
            let direct = direct_path(leaf, n_leaves).unwrap();
            let co = copath(leaf, n_leaves).unwrap();
            prop_assert_eq!(direct.len(), co.len());

            // The direct path ascends strictly in level and ends at the root.
            let mut last_level = 0;
            for node in &direct {
                prop_assert!(level(node.node_index()) > last_level || last_level == 0);
                last_level = level(node.node_index());
            }
            if let Some(top) = direct.last() {
                prop_assert_eq!(top.node_index(), root(n_leaves).node_index());
            }
        }
    }
}
