// SPDX-License-Identifier: MIT OR Apache-2.0

//! TreeKEM: the ratcheting key agreement over the tree.
//!
//! A committer samples a fresh path secret, derives one KEM key pair per node of its filtered
//! direct path and encrypts each node's path secret to the resolution of the copath child at
//! that level. Every other member decrypts exactly one ciphertext (at the lowest updated node
//! above its own leaf), re-derives the chain upward, and checks that every derived public key
//! matches the transmitted one. Both sides end on the same commit secret, which feeds the key
//! schedule.
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::crypto::hpke::HpkeCiphertext;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError, Secret};
use crate::leaf_node::{LeafNode, LeafNodeSource};
use crate::tree::TreeReader;
use crate::tree::hashes::{node_hash, parent_hash};
use crate::tree::math::{self, LeafIndex, NodeIndex, ParentIndex, TreeMathError};
use crate::tree::{ParentNode, TreeError};

/// One node of an update path: the node's new public key and the path secret encrypted to every
/// member of the copath resolution at that level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePathNode {
    pub(crate) public_key: PublicKey,
    pub(crate) encrypted_path_secrets: Vec<HpkeCiphertext>,
}

/// The sender's new leaf plus one [`UpdatePathNode`] per filtered direct-path node, in ascending
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePath {
    pub(crate) leaf_node: LeafNode,
    pub(crate) nodes: Vec<UpdatePathNode>,
}

impl Encode for HpkeCiphertext {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, &self.kem_output)?;
        encode_var_bytes(buffer, VarWidth::U16, &self.ciphertext)
    }
}

impl Decode for HpkeCiphertext {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            kem_output: decode_var_bytes(cursor, VarWidth::U8)?,
            ciphertext: decode_var_bytes(cursor, VarWidth::U16)?,
        })
    }
}

impl Encode for UpdatePathNode {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, self.public_key.as_bytes())?;
        self.encrypted_path_secrets.encode(buffer)
    }
}

impl Decode for UpdatePathNode {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let public_key = decode_var_bytes(cursor, VarWidth::U8)?;
        Ok(Self {
            public_key: PublicKey::from_bytes(
                public_key
                    .try_into()
                    .map_err(|_| CodecError::InvalidLength)?,
            ),
            encrypted_path_secrets: Vec::decode(cursor)?,
        })
    }
}

impl Encode for UpdatePath {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.leaf_node.encode(buffer)?;
        self.nodes.encode(buffer)
    }
}

impl Decode for UpdatePath {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            leaf_node: LeafNode::decode(cursor)?,
            nodes: Vec::decode(cursor)?,
        })
    }
}

/// One link of the path-secret chain.
///
/// `path_secret[k+1] = ExpandWithLabel(path_secret[k], "path", "", Nh)`; the node key pair at a
/// link is `KEM.DeriveKeyPair(ExpandWithLabel(path_secret[k], "node", "", Nh))`.
#[derive(Clone, Debug)]
pub(crate) struct PathSecret(Secret);

impl PathSecret {
    pub(crate) fn random(suite: CipherSuite, rng: &Rng) -> Result<Self, TreeKemError> {
        Ok(Self(Secret::from_bytes(
            rng.random_vec(suite.hash_length())?,
        )))
    }

    pub(crate) fn from_secret(secret: Secret) -> Self {
        Self(secret)
    }

    pub(crate) fn derive_next(&self, suite: CipherSuite) -> Result<Self, TreeKemError> {
        Ok(Self(suite.expand_with_label(
            &self.0,
            "path",
            b"",
            suite.hash_length(),
        )?))
    }

    pub(crate) fn key_pair(
        &self,
        suite: CipherSuite,
    ) -> Result<(SecretKey, PublicKey), TreeKemError> {
        let node_secret = suite.expand_with_label(&self.0, "node", b"", suite.hash_length())?;
        Ok(suite.derive_key_pair(&node_secret)?)
    }

    pub(crate) fn as_secret(&self) -> &Secret {
        &self.0
    }
}

/// Everything a committer produces for a path update.
pub(crate) struct PathUpdate {
    /// Wire representation, one entry per filtered direct-path node.
    pub(crate) nodes: Vec<UpdatePathNode>,
    /// Parent nodes to install along the sender's direct path.
    pub(crate) parent_nodes: Vec<(ParentIndex, ParentNode)>,
    /// Private keys of the new nodes, addressed by node index.
    pub(crate) node_secrets: BTreeMap<u32, SecretKey>,
    /// Path secret per filtered node, for welcome construction.
    pub(crate) path_secrets: Vec<(ParentIndex, PathSecret)>,
    /// Parent hash claimed by the sender's new commit-sourced leaf.
    pub(crate) leaf_parent_hash: Vec<u8>,
    pub(crate) commit_secret: Secret,
}

/// Everything a receiver recovers from a path update.
pub(crate) struct PathApplication {
    pub(crate) parent_nodes: Vec<(ParentIndex, ParentNode)>,
    pub(crate) node_secrets: BTreeMap<u32, SecretKey>,
    pub(crate) commit_secret: Secret,
}

/// Construct an update path for `sender` over the given tree view (proposals applied, sender
/// path blanked).
///
/// `group_context` is the serialized provisional group context and becomes the HPKE `info`;
/// `exclude` names the leaves added in the same commit, which receive their secrets via welcome
/// instead.
pub(crate) fn encrypt_path(
    view: &impl TreeReader,
    suite: CipherSuite,
    sender: LeafIndex,
    group_context: &[u8],
    exclude: &BTreeSet<LeafIndex>,
    rng: &Rng,
) -> Result<PathUpdate, TreeKemError> {
    if view.leaf(sender).is_none() {
        return Err(TreeKemError::BlankSenderLeaf);
    }

    let filtered = view.filtered_direct_path(sender)?;
    if filtered.is_empty() {
        // Nothing to encrypt to; the commit secret degenerates to all zeroes.
        return Ok(PathUpdate {
            nodes: Vec::new(),
            parent_nodes: Vec::new(),
            node_secrets: BTreeMap::new(),
            path_secrets: Vec::new(),
            leaf_parent_hash: Vec::new(),
            commit_secret: Secret::zero(suite.hash_length()),
        });
    }

    // Path-secret chain and per-node key pairs, ascending.
    let mut path_secrets = Vec::with_capacity(filtered.len());
    let mut secret = PathSecret::random(suite, rng)?;
    for index in &filtered {
        path_secrets.push((*index, secret.clone()));
        secret = secret.derive_next(suite)?;
    }
    let commit_secret = secret.as_secret().clone();

    let mut public_keys = Vec::with_capacity(filtered.len());
    let mut node_secrets = BTreeMap::new();
    for (index, path_secret) in &path_secrets {
        let (secret_key, public_key) = path_secret.key_pair(suite)?;
        node_secrets.insert(index.node_index(), secret_key);
        public_keys.push(public_key);
    }

    let (parent_nodes, leaf_parent_hash) =
        build_parent_nodes(view, suite, sender, &filtered, &public_keys)?;

    // Encrypt each node's path secret to the resolution of its copath child.
    let mut nodes = Vec::with_capacity(filtered.len());
    for ((index, path_secret), public_key) in path_secrets.iter().zip(&public_keys) {
        let (_, copath_child) = view.children_relative_to(*index, sender);
        let mut encrypted_path_secrets = Vec::new();
        for member in view.resolution(copath_child, exclude) {
            let member_key = view
                .node_public_key(member)
                .ok_or(TreeKemError::BlankResolutionNode)?;
            encrypted_path_secrets.push(suite.seal(
                member_key,
                group_context,
                b"",
                path_secret.as_secret().as_bytes(),
                rng,
            )?);
        }
        nodes.push(UpdatePathNode {
            public_key: *public_key,
            encrypted_path_secrets,
        });
    }

    Ok(PathUpdate {
        nodes,
        parent_nodes,
        node_secrets,
        path_secrets,
        leaf_parent_hash,
        commit_secret,
    })
}

/// Process an update path as a receiver: decrypt the overlap secret, re-derive the chain, check
/// the transmitted public keys and parent hash, and return the nodes to install.
pub(crate) fn decrypt_path(
    view: &impl TreeReader,
    suite: CipherSuite,
    sender: LeafIndex,
    own_leaf: LeafIndex,
    update_path: &UpdatePath,
    own_keys: &BTreeMap<u32, SecretKey>,
    group_context: &[u8],
    exclude: &BTreeSet<LeafIndex>,
) -> Result<PathApplication, TreeKemError> {
    if view.leaf(sender).is_none() {
        return Err(TreeKemError::BlankSenderLeaf);
    }

    let filtered = view.filtered_direct_path(sender)?;
    if filtered.len() != update_path.nodes.len() {
        return Err(TreeKemError::CiphertextCountMismatch);
    }
    if filtered.is_empty() {
        return Ok(PathApplication {
            parent_nodes: Vec::new(),
            node_secrets: BTreeMap::new(),
            commit_secret: Secret::zero(suite.hash_length()),
        });
    }

    // The first node of the sender's filtered path that is also above us.
    let overlap = filtered
        .iter()
        .position(|index| math::is_ancestor((*index).into(), own_leaf.into()))
        .ok_or(TreeKemError::NoPathOverlap)?;

    // Our position in that node's copath resolution selects the ciphertext.
    let (_, copath_child) = view.children_relative_to(filtered[overlap], sender);
    let resolution = view.resolution(copath_child, exclude);
    let ciphertexts = &update_path.nodes[overlap].encrypted_path_secrets;
    if ciphertexts.len() != resolution.len() {
        return Err(TreeKemError::CiphertextCountMismatch);
    }
    // Among the resolution nodes covering our leaf (possibly both an ancestor node and our own
    // leaf listed as unmerged), use the one whose private key we hold.
    let mut covering = resolution
        .iter()
        .enumerate()
        .filter(|(_, index)| math::is_ancestor(**index, own_leaf.into()))
        .peekable();
    if covering.peek().is_none() {
        return Err(TreeKemError::NoPathOverlap);
    }
    let (position, decryption_key) = covering
        .find_map(|(position, index)| {
            own_keys
                .get(&index.node_index())
                .map(|key| (position, key))
        })
        .ok_or(TreeKemError::MissingDecryptionKey)?;

    let plaintext = suite
        .open(
            &ciphertexts[position],
            decryption_key,
            group_context,
            b"",
        )
        .map_err(|_| TreeKemError::HpkeOpenFailure)?;

    // Re-derive all higher path secrets and check every derived public key against the
    // transmitted one.
    let mut node_secrets = BTreeMap::new();
    let mut path_secret = PathSecret::from_secret(Secret::from_bytes(plaintext));
    for (index, node) in filtered.iter().zip(&update_path.nodes).skip(overlap) {
        let (secret_key, public_key) = path_secret.key_pair(suite)?;
        if public_key != node.public_key {
            return Err(TreeKemError::DerivationMismatch);
        }
        node_secrets.insert(index.node_index(), secret_key);
        path_secret = path_secret.derive_next(suite)?;
    }
    let commit_secret = path_secret.as_secret().clone();

    // Rebuild the parent nodes from the transmitted keys and validate the leaf's claimed parent
    // hash.
    let public_keys: Vec<PublicKey> = update_path.nodes.iter().map(|node| node.public_key).collect();
    let (parent_nodes, leaf_parent_hash) =
        build_parent_nodes(view, suite, sender, &filtered, &public_keys)?;
    match update_path.leaf_node.source() {
        LeafNodeSource::Commit(claimed) if *claimed == leaf_parent_hash => {}
        _ => return Err(TreeKemError::InvalidParentHash),
    }

    Ok(PathApplication {
        parent_nodes,
        node_secrets,
        commit_secret,
    })
}

/// Derive node private keys upward from a path secret received in a welcome, starting at the
/// lowest common ancestor with the committer, checking each derived key against the tree.
pub(crate) fn derive_from_path_secret(
    view: &impl TreeReader,
    suite: CipherSuite,
    start: ParentIndex,
    path_secret: PathSecret,
) -> Result<BTreeMap<u32, SecretKey>, TreeKemError> {
    let n_leaves = view.leaf_count();
    let root = math::root(n_leaves).node_index();

    let mut chain = vec![start];
    let mut current = NodeIndex::from(start);
    while current.node_index() != root {
        let above = math::parent(current, n_leaves)?;
        chain.push(above);
        current = above.into();
    }

    let mut node_secrets = BTreeMap::new();
    let mut secret = path_secret;
    for index in chain {
        // Blank nodes were filtered out of the committer's path; they hold no link.
        let Some(node) = view.parent(index) else {
            continue;
        };
        let (secret_key, public_key) = secret.key_pair(suite)?;
        if public_key != node.encryption_key {
            return Err(TreeKemError::DerivationMismatch);
        }
        node_secrets.insert(index.node_index(), secret_key);
        secret = secret.derive_next(suite)?;
    }

    if node_secrets.is_empty() {
        return Err(TreeKemError::NoPathOverlap);
    }
    Ok(node_secrets)
}

/// Build the parent nodes (with parent hashes chained top-down) for a filtered path with the
/// given new public keys; returns them together with the parent hash the sender's leaf has to
/// claim.
fn build_parent_nodes(
    view: &impl TreeReader,
    suite: CipherSuite,
    sender: LeafIndex,
    filtered: &[ParentIndex],
    public_keys: &[PublicKey],
) -> Result<(Vec<(ParentIndex, ParentNode)>, Vec<u8>), TreeKemError> {
    debug_assert_eq!(filtered.len(), public_keys.len());
    let no_exclusions = BTreeSet::new();

    // The topmost node chains to the empty string; every node below chains to the node above
    // it and the tree hash of that node's non-path subtree.
    let mut hashes = vec![Vec::new(); filtered.len()];
    for i in (0..filtered.len().saturating_sub(1)).rev() {
        let above = filtered[i + 1];
        let (_, copath_child) = view.children_relative_to(above, sender);
        let sibling_hash = node_hash(view, suite, copath_child, &no_exclusions)?;
        hashes[i] = parent_hash(suite, &public_keys[i + 1], &hashes[i + 1], &sibling_hash)?;
    }

    let leaf_parent_hash = {
        let (_, copath_child) = view.children_relative_to(filtered[0], sender);
        let sibling_hash = node_hash(view, suite, copath_child, &no_exclusions)?;
        parent_hash(suite, &public_keys[0], &hashes[0], &sibling_hash)?
    };

    let parent_nodes = filtered
        .iter()
        .zip(public_keys)
        .zip(hashes)
        .map(|((index, public_key), hash)| {
            (
                *index,
                ParentNode {
                    encryption_key: *public_key,
                    parent_hash: hash,
                    unmerged_leaves: Vec::new(),
                },
            )
        })
        .collect();

    Ok((parent_nodes, leaf_parent_hash))
}

#[derive(Debug, Error)]
pub enum TreeKemError {
    #[error("sender leaf is blank")]
    BlankSenderLeaf,

    #[error("no overlap between the update path and the receiver's direct path")]
    NoPathOverlap,

    #[error("ciphertext count does not match the filtered path or resolution")]
    CiphertextCountMismatch,

    #[error("no private key held for the receiver's resolution position")]
    MissingDecryptionKey,

    #[error("could not decrypt the path secret")]
    HpkeOpenFailure,

    #[error("derived public key does not match the transmitted node key")]
    DerivationMismatch,

    #[error("parent hash claimed by the update-path leaf does not verify")]
    InvalidParentHash,

    #[error("resolution names a blank node")]
    BlankResolutionNode,

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Math(#[from] TreeMathError),

    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::ciphersuite::CipherSuite;
    use crate::crypto::x25519::SecretKey;
    use crate::crypto::{Rng, Secret};
    use crate::test_utils::leaf_with_keys;
    use crate::tree::TreeReader;
    use crate::tree::math::LeafIndex;
    use crate::tree::RatchetTree;

    use super::{PathSecret, TreeKemError, decrypt_path, encrypt_path};

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    /// A four-leaf tree with all parents blank, plus each member's leaf secret key.
    fn four_leaf_tree(rng: &Rng) -> (RatchetTree, Vec<SecretKey>) {
        let (founder, _, founder_secret) = leaf_with_keys(SUITE, b"member 0", rng);
        let mut tree = RatchetTree::new(founder);
        let mut secrets = vec![founder_secret];

        let mut diff = tree.diff();
        diff.grow();
        diff.grow();
        for i in 1..4u32 {
            let (leaf, _, secret) = leaf_with_keys(SUITE, format!("member {i}").as_bytes(), rng);
            diff.replace_leaf(LeafIndex::new(i), leaf).unwrap();
            secrets.push(secret);
        }
        tree.merge(diff.stage()).unwrap();
        (tree, secrets)
    }

    fn own_keys(leaf: LeafIndex, secret: &SecretKey) -> BTreeMap<u32, SecretKey> {
        BTreeMap::from([(leaf.node_index(), secret.clone())])
    }

    /// Fake update path with a commit-sourced leaf claiming the computed parent hash.
    fn sender_leaf(rng: &Rng, parent_hash: Vec<u8>) -> crate::leaf_node::LeafNode {
        use crate::credential::Credential;
        use crate::crypto::ed25519::SigningKey;
        use crate::group::GroupId;
        use crate::leaf_node::{Capabilities, LeafNode, LeafNodeSource, TreePosition};

        let signing_key = SigningKey::from_bytes(rng.random_array().unwrap());
        let encryption_secret = SecretKey::from_bytes(rng.random_array().unwrap());
        LeafNode::new(
            SUITE,
            &signing_key,
            encryption_secret.public_key().unwrap(),
            Credential::basic(b"member 0".to_vec()),
            Capabilities::default_for(SUITE),
            LeafNodeSource::Commit(parent_hash),
            Vec::new(),
            Some(&TreePosition {
                group_id: GroupId::from_bytes(b"test".to_vec()),
                leaf_index: LeafIndex::new(0),
            }),
        )
        .unwrap()
    }

    #[test]
    fn receivers_agree_on_the_commit_secret() {
        let rng = Rng::from_seed([1; 32]);
        let (tree, secrets) = four_leaf_tree(&rng);

        let mut view = tree.diff();
        view.blank_path(LeafIndex::new(0)).unwrap();

        let exclude = BTreeSet::new();
        let update = encrypt_path(&view, SUITE, LeafIndex::new(0), b"ctx", &exclude, &rng).unwrap();

        // Two filtered nodes: one ciphertext under node 1, two under the root.
        assert_eq!(update.nodes.len(), 2);
        assert_eq!(update.nodes[0].encrypted_path_secrets.len(), 1);
        assert_eq!(update.nodes[1].encrypted_path_secrets.len(), 2);

        let wire = super::UpdatePath {
            leaf_node: sender_leaf(&rng, update.leaf_parent_hash.clone()),
            nodes: update.nodes.clone(),
        };

        for receiver in 1..4u32 {
            let leaf = LeafIndex::new(receiver);
            let application = decrypt_path(
                &view,
                SUITE,
                LeafIndex::new(0),
                leaf,
                &wire,
                &own_keys(leaf, &secrets[receiver as usize]),
                b"ctx",
                &exclude,
            )
            .unwrap();

            assert_eq!(application.commit_secret, update.commit_secret);
            assert_eq!(application.parent_nodes, update.parent_nodes);
        }
    }

    #[test]
    fn tampered_node_key_is_detected() {
        let rng = Rng::from_seed([2; 32]);
        let (tree, secrets) = four_leaf_tree(&rng);

        let mut view = tree.diff();
        view.blank_path(LeafIndex::new(0)).unwrap();

        let exclude = BTreeSet::new();
        let update = encrypt_path(&view, SUITE, LeafIndex::new(0), b"ctx", &exclude, &rng).unwrap();

        let mut wire = super::UpdatePath {
            leaf_node: sender_leaf(&rng, update.leaf_parent_hash.clone()),
            nodes: update.nodes.clone(),
        };
        // Replace the root node key with an unrelated one.
        let bogus = SecretKey::from_bytes(rng.random_array().unwrap());
        wire.nodes[1].public_key = bogus.public_key().unwrap();

        let leaf = LeafIndex::new(1);
        let result = decrypt_path(
            &view,
            SUITE,
            LeafIndex::new(0),
            leaf,
            &wire,
            &own_keys(leaf, &secrets[1]),
            b"ctx",
            &exclude,
        );
        assert!(matches!(result, Err(TreeKemError::DerivationMismatch)));
    }

    #[test]
    fn wrong_context_fails_to_open() {
        let rng = Rng::from_seed([3; 32]);
        let (tree, secrets) = four_leaf_tree(&rng);

        let mut view = tree.diff();
        view.blank_path(LeafIndex::new(0)).unwrap();

        let exclude = BTreeSet::new();
        let update = encrypt_path(&view, SUITE, LeafIndex::new(0), b"ctx", &exclude, &rng).unwrap();
        let wire = super::UpdatePath {
            leaf_node: sender_leaf(&rng, update.leaf_parent_hash.clone()),
            nodes: update.nodes,
        };

        let leaf = LeafIndex::new(1);
        let result = decrypt_path(
            &view,
            SUITE,
            LeafIndex::new(0),
            leaf,
            &wire,
            &own_keys(leaf, &secrets[1]),
            b"other ctx",
            &exclude,
        );
        assert!(matches!(result, Err(TreeKemError::HpkeOpenFailure)));
    }

    #[test]
    fn truncated_path_is_rejected() {
        let rng = Rng::from_seed([4; 32]);
        let (tree, secrets) = four_leaf_tree(&rng);

        let mut view = tree.diff();
        view.blank_path(LeafIndex::new(0)).unwrap();

        let exclude = BTreeSet::new();
        let update = encrypt_path(&view, SUITE, LeafIndex::new(0), b"ctx", &exclude, &rng).unwrap();
        let mut wire = super::UpdatePath {
            leaf_node: sender_leaf(&rng, update.leaf_parent_hash.clone()),
            nodes: update.nodes,
        };
        wire.nodes.pop();

        let leaf = LeafIndex::new(1);
        let result = decrypt_path(
            &view,
            SUITE,
            LeafIndex::new(0),
            leaf,
            &wire,
            &own_keys(leaf, &secrets[1]),
            b"ctx",
            &exclude,
        );
        assert!(matches!(result, Err(TreeKemError::CiphertextCountMismatch)));
    }

    #[test]
    fn path_secret_chain_is_deterministic() {
        let zero = PathSecret::from_secret(Secret::zero(32));
        let next_1 = zero.derive_next(SUITE).unwrap();
        let next_2 = PathSecret::from_secret(Secret::zero(32))
            .derive_next(SUITE)
            .unwrap();

        assert_eq!(next_1.as_secret(), next_2.as_secret());
        // "path" and "node" derivations diverge.
        let node_secret = SUITE
            .expand_with_label(zero.as_secret(), "node", b"", 32)
            .unwrap();
        assert_ne!(next_1.as_secret(), &node_secret);
    }
}
