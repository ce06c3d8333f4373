// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use crate::leaf_node::LeafNode;
use crate::tree::math::{self, LeafIndex, ParentIndex};
use crate::tree::tree::{ParentNode, RatchetTree, TreeError};
use crate::tree::TreeReader;

/// Staging object for structural tree edits.
///
/// A diff owns only the deltas it introduces: two index-to-node mappings shadowing the base
/// tree, plus a pending leaf capacity. Reads through the diff see the pending changes. Staging
/// freezes the diff into a [`StagedDiff`]; merging it installs all deltas into the tree
/// atomically.
#[derive(Debug)]
pub struct TreeDiff<'a> {
    tree: &'a RatchetTree,
    version: u64,
    leaf_count: u32,
    leaves: BTreeMap<u32, Option<LeafNode>>,
    parents: BTreeMap<usize, Option<ParentNode>>,
}

impl<'a> TreeDiff<'a> {
    pub(crate) fn new(tree: &'a RatchetTree, version: u64) -> Self {
        Self {
            tree,
            version,
            leaf_count: tree.leaf_count(),
            leaves: BTreeMap::new(),
            parents: BTreeMap::new(),
        }
    }

    /// Double the leaf capacity, extending the tree with blanks. Existing node indices are
    /// preserved: the old tree becomes the left subtree of the new root.
    pub fn grow(&mut self) {
        self.leaf_count *= 2;
    }

    /// Halve the leaf capacity. Only possible while every leaf in the upper half is blank; the
    /// parents above the remaining half are discarded.
    pub fn shrink(&mut self) -> Result<(), TreeError> {
        if self.leaf_count < 2 {
            return Err(TreeError::NotShrinkable);
        }
        let half = self.leaf_count / 2;
        for index in half..self.leaf_count {
            if self.leaf(LeafIndex::new(index)).is_some() {
                return Err(TreeError::NotShrinkable);
            }
        }

        self.leaf_count = half;
        self.leaves.retain(|index, _| *index < half);
        self.parents
            .retain(|slot, _| *slot < (half - 1) as usize);
        Ok(())
    }

    /// Replace the leaf at the given position.
    pub fn replace_leaf(&mut self, index: LeafIndex, leaf: LeafNode) -> Result<(), TreeError> {
        self.check_leaf_bounds(index)?;
        self.leaves.insert(index.u32(), Some(leaf));
        Ok(())
    }

    /// Blank the leaf at the given position.
    pub fn blank_leaf(&mut self, index: LeafIndex) -> Result<(), TreeError> {
        self.check_leaf_bounds(index)?;
        self.leaves.insert(index.u32(), None);
        Ok(())
    }

    /// Replace the parent node at the given position.
    pub fn replace_parent(
        &mut self,
        index: ParentIndex,
        parent: ParentNode,
    ) -> Result<(), TreeError> {
        self.check_parent_bounds(index)?;
        self.parents.insert(index.slot(), Some(parent));
        Ok(())
    }

    /// Blank the parent node at the given position.
    pub fn blank_parent(&mut self, index: ParentIndex) -> Result<(), TreeError> {
        self.check_parent_bounds(index)?;
        self.parents.insert(index.slot(), None);
        Ok(())
    }

    /// Blank every parent on the direct path of a leaf, resetting stale unmerged-leaf lists.
    pub fn blank_path(&mut self, leaf: LeafIndex) -> Result<(), TreeError> {
        for index in math::direct_path(leaf, self.leaf_count)? {
            self.blank_parent(index)?;
        }
        Ok(())
    }

    /// Blank the direct path of a leaf and install the given parent nodes along it.
    ///
    /// Every index must lie on the leaf's direct path.
    pub fn set_direct_path(
        &mut self,
        leaf: LeafIndex,
        nodes: Vec<(ParentIndex, ParentNode)>,
    ) -> Result<(), TreeError> {
        let direct_path = math::direct_path(leaf, self.leaf_count)?;
        for (index, _) in &nodes {
            if !direct_path.contains(index) {
                return Err(TreeError::IndexOutOfRange);
            }
        }

        self.blank_path(leaf)?;
        for (index, node) in nodes {
            self.replace_parent(index, node)?;
        }
        Ok(())
    }

    /// Record `leaf` as unmerged on every non-blank parent along its direct path (performed when
    /// a member is added without a fresh path).
    pub fn add_unmerged_leaf(&mut self, leaf: LeafIndex) -> Result<(), TreeError> {
        for index in math::direct_path(leaf, self.leaf_count)? {
            if let Some(parent) = self.parent(index) {
                let mut updated = parent.clone();
                updated.add_unmerged_leaf(leaf);
                self.replace_parent(index, updated)?;
            }
        }
        Ok(())
    }

    /// Freeze this diff for merging.
    pub fn stage(self) -> StagedDiff {
        StagedDiff {
            version: self.version,
            leaf_count: self.leaf_count,
            leaves: self.leaves,
            parents: self.parents,
        }
    }

    fn check_leaf_bounds(&self, index: LeafIndex) -> Result<(), TreeError> {
        if index.u32() >= self.leaf_count {
            return Err(TreeError::IndexOutOfRange);
        }
        Ok(())
    }

    fn check_parent_bounds(&self, index: ParentIndex) -> Result<(), TreeError> {
        if index.node_index() >= math::tree_size(self.leaf_count) {
            return Err(TreeError::IndexOutOfRange);
        }
        Ok(())
    }
}

impl TreeReader for TreeDiff<'_> {
    fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    fn leaf(&self, index: LeafIndex) -> Option<&LeafNode> {
        if index.u32() >= self.leaf_count {
            return None;
        }
        match self.leaves.get(&index.u32()) {
            Some(pending) => pending.as_ref(),
            None => self.tree.leaf(index),
        }
    }

    fn parent(&self, index: ParentIndex) -> Option<&ParentNode> {
        if index.node_index() >= math::tree_size(self.leaf_count) {
            return None;
        }
        match self.parents.get(&index.slot()) {
            Some(pending) => pending.as_ref(),
            None => self.tree.parent(index),
        }
    }
}

/// An immutable bundle of deltas, ready to be merged into the tree it was staged from.
#[derive(Debug)]
pub struct StagedDiff {
    version: u64,
    leaf_count: u32,
    leaves: BTreeMap<u32, Option<LeafNode>>,
    parents: BTreeMap<usize, Option<ParentNode>>,
}

impl StagedDiff {
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    pub(crate) fn leaf_keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.leaves.keys().copied()
    }

    pub(crate) fn parent_keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.parents.keys().copied()
    }

    pub(crate) fn into_pending(
        self,
    ) -> (
        BTreeMap<u32, Option<LeafNode>>,
        BTreeMap<usize, Option<ParentNode>>,
    ) {
        (self.leaves, self.parents)
    }
}

#[cfg(test)]
mod tests {
    use crate::ciphersuite::CipherSuite;
    use crate::crypto::Rng;
    use crate::leaf_node::LeafNode;
    use crate::test_utils::leaf_with_keys;
    use crate::tree::TreeReader;
    use crate::tree::math::LeafIndex;
    use crate::tree::tree::{RatchetTree, TreeError};

    fn test_leaf(rng: &Rng, identity: &[u8]) -> LeafNode {
        leaf_with_keys(
            CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519,
            identity,
            rng,
        )
        .0
    }

    #[test]
    fn reads_shadow_the_base_tree() {
        let rng = Rng::from_seed([1; 32]);
        let founder = test_leaf(&rng, b"founder");
        let tree = RatchetTree::new(founder.clone());

        let mut diff = tree.diff();
        diff.grow();
        let second = test_leaf(&rng, b"second");
        diff.replace_leaf(LeafIndex::new(1), second.clone()).unwrap();

        assert_eq!(diff.leaf(LeafIndex::new(0)), Some(&founder));
        assert_eq!(diff.leaf(LeafIndex::new(1)), Some(&second));
        // Nothing changed underneath.
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn out_of_range_writes_rejected() {
        let rng = Rng::from_seed([2; 32]);
        let tree = RatchetTree::new(test_leaf(&rng, b"founder"));

        let mut diff = tree.diff();
        let result = diff.replace_leaf(LeafIndex::new(1), test_leaf(&rng, b"second"));
        assert!(matches!(result, Err(TreeError::IndexOutOfRange)));
    }

    #[test]
    fn shrink_drops_pending_upper_writes() {
        let rng = Rng::from_seed([3; 32]);
        let mut tree = RatchetTree::new(test_leaf(&rng, b"founder"));

        let mut diff = tree.diff();
        diff.grow();
        diff.replace_leaf(LeafIndex::new(1), test_leaf(&rng, b"second"))
            .unwrap();
        diff.blank_leaf(LeafIndex::new(1)).unwrap();
        diff.shrink().unwrap();
        tree.merge(diff.stage()).unwrap();

        assert_eq!(tree.leaf_count(), 1);
    }
}
