// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tree hash and parent hash.
//!
//! The tree hash summarizes a whole subtree and binds it into the group context; the parent
//! hash chains each node to the key material above it so a leaf cannot be grafted under
//! foreign parents unnoticed.
use std::collections::BTreeSet;

use crate::ciphersuite::CipherSuite;
use crate::codec::{CodecError, Encode, VarWidth, encode_var_bytes};
use crate::crypto::x25519::PublicKey;
use crate::tree::TreeReader;
use crate::tree::math::{self, LeafIndex, NodeIndex};
use crate::tree::tree::TreeError;

/// Hash of the whole tree, as bound into the group context.
pub(crate) fn tree_hash(
    view: &(impl TreeReader + ?Sized),
    suite: CipherSuite,
) -> Result<Vec<u8>, TreeError> {
    node_hash(view, suite, math::root(view.leaf_count()), &BTreeSet::new())
}

/// Hash of the subtree rooted at `index`. Leaves in `exclude` are hashed as blank and removed
/// from unmerged-leaves lists, which yields the "original" sibling tree hash needed for parent
/// hashes.
pub(crate) fn node_hash(
    view: &(impl TreeReader + ?Sized),
    suite: CipherSuite,
    index: NodeIndex,
    exclude: &BTreeSet<LeafIndex>,
) -> Result<Vec<u8>, TreeError> {
    let mut input = Vec::new();
    match index {
        NodeIndex::Leaf(leaf) => {
            1u8.encode(&mut input)?;
            leaf.encode(&mut input)?;
            let node = if exclude.contains(&leaf) {
                None
            } else {
                view.leaf(leaf)
            };
            encode_presence(&mut input, node)?;
        }
        NodeIndex::Parent(parent) => {
            2u8.encode(&mut input)?;
            match view.parent(parent) {
                None => 0u8.encode(&mut input)?,
                Some(node) => {
                    1u8.encode(&mut input)?;
                    let mut node = node.clone();
                    node.unmerged_leaves.retain(|leaf| !exclude.contains(leaf));
                    node.encode(&mut input)?;
                }
            }
            let left_hash = node_hash(view, suite, math::left(parent), exclude)?;
            let right_hash = node_hash(
                view,
                suite,
                math::right(parent, view.leaf_count()),
                exclude,
            )?;
            encode_var_bytes(&mut input, VarWidth::U8, &left_hash)?;
            encode_var_bytes(&mut input, VarWidth::U8, &right_hash)?;
        }
    }
    Ok(suite.hash(&input)?)
}

/// `ParentHashInput`: a node's new encryption key, the parent hash above it and the tree hash of
/// its non-path child's subtree.
pub(crate) fn parent_hash(
    suite: CipherSuite,
    encryption_key: &PublicKey,
    parent_hash_above: &[u8],
    original_sibling_tree_hash: &[u8],
) -> Result<Vec<u8>, TreeError> {
    let mut input = Vec::new();
    encode_var_bytes(&mut input, VarWidth::U8, encryption_key.as_bytes())?;
    encode_var_bytes(&mut input, VarWidth::U8, parent_hash_above)?;
    encode_var_bytes(&mut input, VarWidth::U8, original_sibling_tree_hash)?;
    Ok(suite.hash(&input)?)
}

fn encode_presence<T: Encode>(buffer: &mut Vec<u8>, value: Option<&T>) -> Result<(), CodecError> {
    match value {
        None => 0u8.encode(buffer),
        Some(value) => {
            1u8.encode(buffer)?;
            value.encode(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::ciphersuite::CipherSuite;
    use crate::crypto::Rng;
    use crate::test_utils::leaf_with_keys;
    use crate::tree::math::LeafIndex;
    use crate::tree::tree::RatchetTree;

    use super::tree_hash;

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    #[test]
    fn hash_tracks_tree_contents() {
        let rng = Rng::from_seed([1; 32]);
        let (founder, _, _) = leaf_with_keys(SUITE, b"founder", &rng);
        let mut tree = RatchetTree::new(founder);

        let hash_1 = tree_hash(&tree, SUITE).unwrap();
        assert_eq!(hash_1, tree_hash(&tree, SUITE).unwrap());

        let mut diff = tree.diff();
        diff.grow();
        diff.replace_leaf(LeafIndex::new(1), leaf_with_keys(SUITE, b"second", &rng).0)
            .unwrap();
        tree.merge(diff.stage()).unwrap();

        let hash_2 = tree_hash(&tree, SUITE).unwrap();
        assert_ne!(hash_1, hash_2);

        let mut diff = tree.diff();
        diff.blank_leaf(LeafIndex::new(1)).unwrap();
        tree.merge(diff.stage()).unwrap();

        assert_ne!(hash_2, tree_hash(&tree, SUITE).unwrap());
    }

    #[test]
    fn excluded_leaves_hash_as_blank() {
        let rng = Rng::from_seed([2; 32]);
        let (founder, _, _) = leaf_with_keys(SUITE, b"founder", &rng);
        let mut tree = RatchetTree::new(founder);

        let mut diff = tree.diff();
        diff.grow();
        diff.replace_leaf(LeafIndex::new(1), leaf_with_keys(SUITE, b"second", &rng).0)
            .unwrap();
        tree.merge(diff.stage()).unwrap();

        let full = super::node_hash(&tree, SUITE, crate::tree::math::root(2), &BTreeSet::new())
            .unwrap();
        let excluded = super::node_hash(
            &tree,
            SUITE,
            crate::tree::math::root(2),
            &BTreeSet::from([LeafIndex::new(1)]),
        )
        .unwrap();
        assert_ne!(full, excluded);

        // Excluding the second leaf hashes like a tree where it is blank.
        let mut diff = tree.diff();
        diff.blank_leaf(LeafIndex::new(1)).unwrap();
        tree.merge(diff.stage()).unwrap();
        assert_eq!(excluded, tree_hash(&tree, SUITE).unwrap());
    }
}
