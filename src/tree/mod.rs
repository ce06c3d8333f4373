// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ratchet tree: array-backed storage of leaf and parent nodes addressed by the index
//! algebra of [`math`], staged structural edits with atomic merge, and the tree- and parent-hash
//! constructions.
pub mod diff;
pub(crate) mod hashes;
pub mod math;
#[allow(clippy::module_inception)]
mod tree;

use std::collections::BTreeSet;

pub use tree::{Node, ParentNode, RatchetTree, TreeError};

use crate::crypto::x25519::PublicKey;
use crate::leaf_node::LeafNode;
use self::math::{LeafIndex, NodeIndex, ParentIndex, TreeMathError};

/// Read access to a tree-shaped node collection.
///
/// Implemented by [`RatchetTree`] itself and by [`diff::TreeDiff`], whose reads see pending
/// changes shadowing the base tree. All derived queries (resolutions, filtered paths) are
/// defined on top of this so they apply uniformly to both.
pub(crate) trait TreeReader {
    fn leaf_count(&self) -> u32;

    fn leaf(&self, index: LeafIndex) -> Option<&LeafNode>;

    fn parent(&self, index: ParentIndex) -> Option<&ParentNode>;

    /// Public key stored at a node, if the node is non-blank.
    fn node_public_key(&self, index: NodeIndex) -> Option<&PublicKey> {
        match index {
            NodeIndex::Leaf(leaf) => self.leaf(leaf).map(|node| node.encryption_key()),
            NodeIndex::Parent(parent) => self.parent(parent).map(|node| &node.encryption_key),
        }
    }

    /// First blank leaf slot, if any.
    fn free_leaf(&self) -> Option<LeafIndex> {
        (0..self.leaf_count())
            .map(LeafIndex::new)
            .find(|index| self.leaf(*index).is_none())
    }

    /// The resolution of a node: the minimal set of non-blank nodes whose public keys cover the
    /// node's subtree, plus any unmerged leaves attached to it. Leaves listed in `exclude` are
    /// treated as blank.
    fn resolution(&self, index: NodeIndex, exclude: &BTreeSet<LeafIndex>) -> Vec<NodeIndex> {
        match index {
            NodeIndex::Leaf(leaf) => {
                if exclude.contains(&leaf) || self.leaf(leaf).is_none() {
                    Vec::new()
                } else {
                    vec![index]
                }
            }
            NodeIndex::Parent(parent) => match self.parent(parent) {
                Some(node) => {
                    let mut resolution = vec![index];
                    for leaf in &node.unmerged_leaves {
                        if !exclude.contains(leaf) && self.leaf(*leaf).is_some() {
                            resolution.push(NodeIndex::from(*leaf));
                        }
                    }
                    resolution
                }
                None => {
                    let mut resolution =
                        self.resolution(math::left(parent), exclude);
                    resolution.extend(self.resolution(
                        math::right(parent, self.leaf_count()),
                        exclude,
                    ));
                    resolution
                }
            },
        }
    }

    /// Direct path of a leaf with every node removed whose copath child resolves to nothing;
    /// those nodes would have no one to encrypt to and stay blank across a path update.
    fn filtered_direct_path(&self, leaf: LeafIndex) -> Result<Vec<ParentIndex>, TreeMathError> {
        let n_leaves = self.leaf_count();
        let direct_path = math::direct_path(leaf, n_leaves)?;
        let copath = math::copath(leaf, n_leaves)?;
        let empty = BTreeSet::new();

        Ok(direct_path
            .into_iter()
            .zip(copath)
            .filter(|(_, copath_child)| !self.resolution(*copath_child, &empty).is_empty())
            .map(|(node, _)| node)
            .collect())
    }

    /// The child of `parent` which is an ancestor of `leaf`, and its sibling (the copath child).
    fn children_relative_to(
        &self,
        parent: ParentIndex,
        leaf: LeafIndex,
    ) -> (NodeIndex, NodeIndex) {
        let left = math::left(parent);
        let right = math::right(parent, self.leaf_count());
        if math::is_ancestor(left, leaf.into()) {
            (left, right)
        } else {
            (right, left)
        }
    }
}
