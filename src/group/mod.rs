// SPDX-License-Identifier: MIT OR Apache-2.0

//! The group handle: the single owner of a group's tree, epoch secrets and private keys, and
//! the only legitimate mutator of them.
//!
//! All operations are synchronous and run to completion or fail without leaving partial state:
//! every tree mutation goes through a diff that is merged atomically at the end of a successful
//! operation. One handle serves one group; the same member in several groups uses separate
//! handles.
mod commit;
mod welcome;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;
use tracing::debug;

pub use commit::{AddProposal, Commit, Proposal, RemoveProposal};
pub use welcome::Welcome;

use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::credential::Credential;
use crate::crypto::aead::AeadNonce;
use crate::crypto::ed25519::{Signature, SigningKey};
use crate::crypto::x25519::{SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::key_package::{KeyPackage, KeyPackageBundle, KeyPackageError};
use crate::key_schedule::{self, EpochSecrets, KeyScheduleError};
use crate::leaf_node::{
    EXTENSION_TYPE_RATCHET_TREE, Extension, LeafNode, LeafNodeError, LeafNodeSource, TreePosition,
};
use crate::tree::diff::TreeDiff;
use crate::tree::hashes;
use crate::tree::math::{self, LeafIndex, TreeMathError};
use crate::tree::{RatchetTree, TreeError, TreeReader};
use crate::treekem::{self, PathSecret, TreeKemError, UpdatePath};
use welcome::{EncryptedGroupSecrets, GroupInfo, GroupSecrets};

/// Opaque group identifier chosen by the creator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Encode for GroupId {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U16, &self.0)
    }
}

impl Decode for GroupId {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self(decode_var_bytes(cursor, VarWidth::U16)?))
    }
}

/// The tuple bound into signatures and HPKE `info` fields: it pins a message to one group, one
/// epoch, one tree state and one transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupContext {
    pub(crate) group_id: GroupId,
    pub(crate) epoch: u64,
    pub(crate) tree_hash: Vec<u8>,
    pub(crate) confirmed_transcript_hash: Vec<u8>,
    pub(crate) extensions: Vec<Extension>,
}

impl Encode for GroupContext {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.group_id.encode(buffer)?;
        self.epoch.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, &self.tree_hash)?;
        encode_var_bytes(buffer, VarWidth::U8, &self.confirmed_transcript_hash)?;
        self.extensions.encode(buffer)
    }
}

impl Decode for GroupContext {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            group_id: GroupId::decode(cursor)?,
            epoch: u64::decode(cursor)?,
            tree_hash: decode_var_bytes(cursor, VarWidth::U8)?,
            confirmed_transcript_hash: decode_var_bytes(cursor, VarWidth::U8)?,
            extensions: Vec::decode(cursor)?,
        })
    }
}

/// A current group member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub index: LeafIndex,
    pub credential: Credential,
}

/// Handle over one member's view of one group.
#[derive(Debug)]
pub struct Group {
    suite: CipherSuite,
    group_id: GroupId,
    epoch: u64,
    tree: RatchetTree,
    context_extensions: Vec<Extension>,
    confirmed_transcript_hash: Vec<u8>,
    interim_transcript_hash: Vec<u8>,
    epoch_secrets: EpochSecrets,
    own_leaf_index: LeafIndex,
    signature_secret: SigningKey,
    /// HPKE private keys this member holds, addressed by node index: its own leaf plus every
    /// path node whose secret it has learned.
    node_secrets: BTreeMap<u32, SecretKey>,
    /// References of key packages already used for an add; reuse is rejected unless the package
    /// is marked last-resort.
    used_key_package_refs: Vec<Vec<u8>>,
}

/// Leaf assignments performed while applying proposals to a diff.
struct AppliedProposals {
    joiners: Vec<(LeafIndex, KeyPackage)>,
    new_refs: Vec<Vec<u8>>,
}

impl Group {
    /// Found a new group at epoch 0 with the creator as its only member.
    pub fn create(
        suite: CipherSuite,
        creator: KeyPackageBundle,
        group_id: GroupId,
        extensions: Vec<Extension>,
        rng: &Rng,
    ) -> Result<Self, GroupError> {
        creator.key_package().verify(suite)?;

        let KeyPackageBundle {
            key_package,
            init_secret: _,
            encryption_secret,
            signature_secret,
        } = creator;

        let own_leaf_index = LeafIndex::new(0);
        let tree = RatchetTree::new(key_package.leaf_node().clone());
        let tree_hash = hashes::tree_hash(&tree, suite)?;

        let context = GroupContext {
            group_id: group_id.clone(),
            epoch: 0,
            tree_hash,
            confirmed_transcript_hash: Vec::new(),
            extensions: extensions.clone(),
        };

        // Epoch 0 has no commit; its schedule runs from a random init secret and a zero commit
        // secret.
        let init_secret = Secret::from_bytes(rng.random_vec(suite.hash_length())?);
        let schedule = key_schedule::advance(
            suite,
            &init_secret,
            &Secret::zero(suite.hash_length()),
            None,
            &context.to_bytes()?,
        )?;

        debug!(group_id = %group_id, "created group");

        Ok(Self {
            suite,
            group_id,
            epoch: 0,
            tree,
            context_extensions: extensions,
            confirmed_transcript_hash: Vec::new(),
            interim_transcript_hash: Vec::new(),
            epoch_secrets: schedule.epoch_secrets,
            own_leaf_index,
            signature_secret,
            node_secrets: BTreeMap::from([(own_leaf_index.node_index(), encryption_secret)]),
            used_key_package_refs: Vec::new(),
        })
    }

    /// Add a member, producing the welcome for the joiner and the commit for everyone else.
    ///
    /// The local state advances to the new epoch immediately.
    pub fn add_member(
        &mut self,
        key_package: KeyPackage,
        rng: &Rng,
    ) -> Result<(Welcome, Commit), GroupError> {
        let proposals = vec![Proposal::Add(AddProposal { key_package })];
        let (commit, welcome) = self.create_commit(proposals, rng)?;
        let welcome = welcome.expect("an add always yields a welcome");
        Ok((welcome, commit))
    }

    /// Remove the member at a leaf.
    pub fn remove_member(&mut self, removed: LeafIndex, rng: &Rng) -> Result<Commit, GroupError> {
        if removed == self.own_leaf_index {
            return Err(GroupError::CannotRemoveSelf);
        }
        if self.tree.leaf(removed).is_none() {
            return Err(GroupError::UnknownMember);
        }
        let proposals = vec![Proposal::Remove(RemoveProposal { removed })];
        let (commit, _) = self.create_commit(proposals, rng)?;
        Ok(commit)
    }

    /// Refresh this member's leaf and path secrets (post-compromise security).
    pub fn update(&mut self, rng: &Rng) -> Result<Commit, GroupError> {
        let (commit, _) = self.create_commit(Vec::new(), rng)?;
        Ok(commit)
    }

    /// Apply a commit received from another member.
    pub fn process_commit(&mut self, commit: &Commit) -> Result<(), GroupError> {
        if commit.group_id != self.group_id {
            return Err(GroupError::WrongGroup);
        }
        if commit.epoch != self.epoch || commit.sender == self.own_leaf_index {
            // Exactly one commit per epoch; anything else arrives too late.
            return Err(GroupError::EpochClosed);
        }

        let suite = self.suite;
        let sender = commit.sender;
        let sender_leaf = self
            .tree
            .leaf(sender)
            .ok_or(TreeKemError::BlankSenderLeaf)?;

        // Framing signature under the sender's current leaf key and the current context.
        let content_bytes = commit.content_bytes()?;
        let tbs = Commit::to_be_signed(&content_bytes, &self.current_context()?.to_bytes()?)?;
        suite
            .verify_with_label(
                sender_leaf.signature_key(),
                "FramedContentTBS",
                &tbs,
                &commit.signature,
            )
            .map_err(|_| GroupError::InvalidSignature)?;

        let mut diff = self.tree.diff();
        let applied =
            apply_proposals(&mut diff, suite, &commit.proposals, &self.used_key_package_refs)?;
        if diff.leaf(self.own_leaf_index).is_none() {
            return Err(GroupError::RemovedFromGroup);
        }
        diff.blank_path(sender)?;

        let exclude: BTreeSet<LeafIndex> =
            applied.joiners.iter().map(|(index, _)| *index).collect();
        let path = commit.path.as_ref().ok_or(GroupError::MissingUpdatePath)?;
        path.leaf_node.verify(
            suite,
            Some(&TreePosition {
                group_id: self.group_id.clone(),
                leaf_index: sender,
            }),
        )?;

        let provisional_context = GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            tree_hash: hashes::tree_hash(&diff, suite)?,
            confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
            extensions: self.context_extensions.clone(),
        };
        let application = treekem::decrypt_path(
            &diff,
            suite,
            sender,
            self.own_leaf_index,
            path,
            &self.node_secrets,
            &provisional_context.to_bytes()?,
            &exclude,
        )?;

        diff.set_direct_path(sender, application.parent_nodes.clone())?;
        diff.replace_leaf(sender, path.leaf_node.clone())?;

        let confirmed = commit::confirmed_transcript_hash(
            suite,
            &self.interim_transcript_hash,
            &content_bytes,
            &commit.signature,
        )?;
        let final_context = GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            tree_hash: hashes::tree_hash(&diff, suite)?,
            confirmed_transcript_hash: confirmed.clone(),
            extensions: self.context_extensions.clone(),
        };
        let schedule = key_schedule::advance(
            suite,
            &self.epoch_secrets.init_secret,
            &application.commit_secret,
            None,
            &final_context.to_bytes()?,
        )?;
        if !key_schedule::verify_confirmation_tag(
            &schedule.epoch_secrets.confirmation_key,
            &confirmed,
            &commit.confirmation_tag,
        ) {
            return Err(GroupError::InvalidConfirmationTag);
        }
        let interim =
            commit::interim_transcript_hash(suite, &confirmed, &commit.confirmation_tag)?;

        let staged = diff.stage();
        self.tree.merge(staged)?;

        // Keys along the sender's path are stale now; keep only what the path application
        // handed back.
        for index in math::direct_path(sender, self.tree.leaf_count())? {
            self.node_secrets.remove(&index.node_index());
        }
        self.node_secrets.extend(application.node_secrets);

        self.epoch += 1;
        self.confirmed_transcript_hash = confirmed;
        self.interim_transcript_hash = interim;
        self.epoch_secrets = schedule.epoch_secrets;
        self.used_key_package_refs.extend(applied.new_refs);

        debug!(group_id = %self.group_id, epoch = self.epoch, sender = sender.u32(),
            "processed commit");
        Ok(())
    }

    /// Join a group from a welcome, consuming the key package bundle the welcome was addressed
    /// to.
    pub fn process_welcome(
        suite: CipherSuite,
        bundle: KeyPackageBundle,
        welcome: &Welcome,
    ) -> Result<Self, GroupError> {
        if welcome.cipher_suite != suite {
            return Err(GroupError::WrongSuite);
        }

        let reference = bundle.key_package().hash_ref()?;
        let entry = welcome
            .secrets
            .iter()
            .find(|secrets| secrets.new_member == reference)
            .ok_or(GroupError::NoMatchingKeyPackage)?;

        let KeyPackageBundle {
            key_package,
            init_secret,
            encryption_secret,
            signature_secret,
        } = bundle;

        // Joiner secrets, sealed to our init key and bound to the encrypted group info.
        let group_secrets_bytes = suite.decrypt_with_label(
            &entry.encrypted_group_secrets,
            &init_secret,
            "Welcome",
            &welcome.encrypted_group_info,
        )?;
        let group_secrets = GroupSecrets::from_bytes(&group_secrets_bytes)?;

        // The welcome key and nonce fall out of the schedule before the group context is known.
        let member_secret = suite.extract(
            group_secrets.joiner_secret.as_bytes(),
            Secret::zero(suite.hash_length()).as_bytes(),
        )?;
        let welcome_secret = suite.derive_secret(&member_secret, "welcome")?;
        let welcome_key =
            suite.expand_with_label(&welcome_secret, "key", b"", suite.aead_key_length()?)?;
        let welcome_nonce =
            suite.expand_with_label(&welcome_secret, "nonce", b"", suite.aead_nonce_length())?;
        let nonce: AeadNonce = welcome_nonce
            .as_bytes()
            .try_into()
            .expect("requested nonce size");

        let group_info_bytes =
            suite.aead_decrypt(welcome_key.as_bytes(), &welcome.encrypted_group_info, nonce, b"")?;
        let group_info = GroupInfo::from_bytes(&group_info_bytes)?;
        let context = group_info.group_context.clone();

        // Reconstruct and validate the tree.
        let tree_extension = group_info
            .extensions
            .iter()
            .find(|extension| extension.extension_type == EXTENSION_TYPE_RATCHET_TREE)
            .ok_or(GroupError::MissingRatchetTree)?;
        let tree = RatchetTree::from_bytes(&tree_extension.extension_data)?;
        if hashes::tree_hash(&tree, suite)? != context.tree_hash {
            return Err(GroupError::InvalidTreeHash);
        }

        // Group info signature under the committer's leaf.
        let signer_leaf = tree
            .leaf(group_info.signer)
            .ok_or(GroupError::UnknownMember)?;
        suite
            .verify_with_label(
                signer_leaf.signature_key(),
                "GroupInfoTBS",
                &group_info.to_be_signed()?,
                &group_info.signature,
            )
            .map_err(|_| GroupError::InvalidSignature)?;

        // Our own position is wherever the commit placed our leaf.
        let own_leaf_index = (0..tree.leaf_count())
            .map(LeafIndex::new)
            .find(|index| tree.leaf(*index) == Some(key_package.leaf_node()))
            .ok_or(GroupError::UnknownMember)?;

        // Enter the epoch's key schedule from the joiner secret.
        let schedule = key_schedule::from_joiner(
            suite,
            &group_secrets.joiner_secret,
            None,
            &context.to_bytes()?,
        )?;
        if !key_schedule::verify_confirmation_tag(
            &schedule.epoch_secrets.confirmation_key,
            &context.confirmed_transcript_hash,
            &group_info.confirmation_tag,
        ) {
            return Err(GroupError::InvalidConfirmationTag);
        }
        let interim = commit::interim_transcript_hash(
            suite,
            &context.confirmed_transcript_hash,
            &group_info.confirmation_tag,
        )?;

        // Private keys: our leaf, plus the committer's path from our common ancestor upward.
        let mut node_secrets =
            BTreeMap::from([(own_leaf_index.node_index(), encryption_secret)]);
        if let Some(path_secret) = group_secrets.path_secret {
            let start = math::lowest_common_ancestor(
                group_info.signer,
                own_leaf_index,
                tree.leaf_count(),
            )?;
            let derived = treekem::derive_from_path_secret(
                &tree,
                suite,
                start,
                PathSecret::from_secret(path_secret),
            )?;
            node_secrets.extend(derived);
        }

        debug!(group_id = %context.group_id, epoch = context.epoch,
            leaf = own_leaf_index.u32(), "joined group from welcome");

        Ok(Self {
            suite,
            group_id: context.group_id.clone(),
            epoch: context.epoch,
            tree,
            context_extensions: context.extensions,
            confirmed_transcript_hash: context.confirmed_transcript_hash,
            interim_transcript_hash: interim,
            epoch_secrets: schedule.epoch_secrets,
            own_leaf_index,
            signature_secret,
            node_secrets,
            used_key_package_refs: Vec::new(),
        })
    }

    /// Export a secret derived from this epoch's exporter secret, for out-of-band payload
    /// encryption.
    pub fn export_secret(
        &self,
        label: &str,
        context: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, GroupError> {
        Ok(key_schedule::export_secret(
            self.suite,
            &self.epoch_secrets.exporter_secret,
            label,
            context,
            length,
        )?)
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn own_leaf_index(&self) -> LeafIndex {
        self.own_leaf_index
    }

    /// Current members, in leaf order.
    pub fn members(&self) -> Vec<Member> {
        (0..self.tree.leaf_count())
            .map(LeafIndex::new)
            .filter_map(|index| {
                self.tree.leaf(index).map(|leaf| Member {
                    index,
                    credential: leaf.credential().clone(),
                })
            })
            .collect()
    }

    fn current_context(&self) -> Result<GroupContext, GroupError> {
        Ok(GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            tree_hash: hashes::tree_hash(&self.tree, self.suite)?,
            confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
            extensions: self.context_extensions.clone(),
        })
    }

    fn create_commit(
        &mut self,
        proposals: Vec<Proposal>,
        rng: &Rng,
    ) -> Result<(Commit, Option<Welcome>), GroupError> {
        let suite = self.suite;
        let current_context_bytes = self.current_context()?.to_bytes()?;

        let mut diff = self.tree.diff();
        let applied = apply_proposals(&mut diff, suite, &proposals, &self.used_key_package_refs)?;
        diff.blank_path(self.own_leaf_index)?;

        let exclude: BTreeSet<LeafIndex> =
            applied.joiners.iter().map(|(index, _)| *index).collect();

        let provisional_context = GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            tree_hash: hashes::tree_hash(&diff, suite)?,
            confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
            extensions: self.context_extensions.clone(),
        };
        let path_update = treekem::encrypt_path(
            &diff,
            suite,
            self.own_leaf_index,
            &provisional_context.to_bytes()?,
            &exclude,
            rng,
        )?;

        // Fresh leaf key pair; identity and capabilities carry over.
        let old_leaf = diff
            .leaf(self.own_leaf_index)
            .ok_or(GroupError::UnknownMember)?
            .clone();
        let leaf_encryption_secret = SecretKey::from_bytes(rng.random_array()?);
        let new_leaf = LeafNode::new(
            suite,
            &self.signature_secret,
            leaf_encryption_secret.public_key()?,
            old_leaf.credential().clone(),
            old_leaf.capabilities().clone(),
            LeafNodeSource::Commit(path_update.leaf_parent_hash.clone()),
            old_leaf.extensions.clone(),
            Some(&TreePosition {
                group_id: self.group_id.clone(),
                leaf_index: self.own_leaf_index,
            }),
        )?;

        diff.set_direct_path(self.own_leaf_index, path_update.parent_nodes.clone())?;
        diff.replace_leaf(self.own_leaf_index, new_leaf.clone())?;

        let mut commit = Commit {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            sender: self.own_leaf_index,
            proposals,
            path: Some(UpdatePath {
                leaf_node: new_leaf,
                nodes: path_update.nodes.clone(),
            }),
            confirmation_tag: Vec::new(),
            signature: Signature::from_bytes([0; 64]),
        };
        let content_bytes = commit.content_bytes()?;
        let tbs = Commit::to_be_signed(&content_bytes, &current_context_bytes)?;
        commit.signature =
            suite.sign_with_label(&self.signature_secret, "FramedContentTBS", &tbs)?;

        let confirmed = commit::confirmed_transcript_hash(
            suite,
            &self.interim_transcript_hash,
            &content_bytes,
            &commit.signature,
        )?;
        let final_context = GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            tree_hash: hashes::tree_hash(&diff, suite)?,
            confirmed_transcript_hash: confirmed.clone(),
            extensions: self.context_extensions.clone(),
        };
        let schedule = key_schedule::advance(
            suite,
            &self.epoch_secrets.init_secret,
            &path_update.commit_secret,
            None,
            &final_context.to_bytes()?,
        )?;
        commit.confirmation_tag = key_schedule::confirmation_tag(
            &schedule.epoch_secrets.confirmation_key,
            &confirmed,
        );
        let interim =
            commit::interim_transcript_hash(suite, &confirmed, &commit.confirmation_tag)?;

        let staged = diff.stage();
        self.tree.merge(staged)?;

        let welcome = if applied.joiners.is_empty() {
            None
        } else {
            Some(self.build_welcome(
                &final_context,
                &schedule,
                &commit.confirmation_tag,
                &applied.joiners,
                &path_update,
                rng,
            )?)
        };

        self.epoch += 1;
        self.confirmed_transcript_hash = confirmed;
        self.interim_transcript_hash = interim;
        self.epoch_secrets = schedule.epoch_secrets;
        self.node_secrets = BTreeMap::from([(
            self.own_leaf_index.node_index(),
            leaf_encryption_secret,
        )]);
        self.node_secrets.extend(path_update.node_secrets);
        self.used_key_package_refs.extend(applied.new_refs);

        debug!(group_id = %self.group_id, epoch = self.epoch, "created commit");
        Ok((commit, welcome))
    }

    fn build_welcome(
        &self,
        final_context: &GroupContext,
        schedule: &key_schedule::KeyScheduleOutput,
        confirmation_tag: &[u8],
        joiners: &[(LeafIndex, KeyPackage)],
        path_update: &treekem::PathUpdate,
        rng: &Rng,
    ) -> Result<Welcome, GroupError> {
        let suite = self.suite;

        let mut group_info = GroupInfo {
            group_context: final_context.clone(),
            extensions: vec![Extension {
                extension_type: EXTENSION_TYPE_RATCHET_TREE,
                extension_data: self.tree.to_bytes()?,
            }],
            confirmation_tag: confirmation_tag.to_vec(),
            signer: self.own_leaf_index,
            signature: Signature::from_bytes([0; 64]),
        };
        group_info.signature = suite.sign_with_label(
            &self.signature_secret,
            "GroupInfoTBS",
            &group_info.to_be_signed()?,
        )?;

        let welcome_key = suite.expand_with_label(
            &schedule.welcome_secret,
            "key",
            b"",
            suite.aead_key_length()?,
        )?;
        let welcome_nonce = suite.expand_with_label(
            &schedule.welcome_secret,
            "nonce",
            b"",
            suite.aead_nonce_length(),
        )?;
        let nonce: AeadNonce = welcome_nonce
            .as_bytes()
            .try_into()
            .expect("requested nonce size");
        let encrypted_group_info =
            suite.aead_encrypt(welcome_key.as_bytes(), &group_info.to_bytes()?, nonce, b"")?;

        let mut secrets = Vec::with_capacity(joiners.len());
        for (leaf_index, key_package) in joiners {
            let path_secret = if path_update.path_secrets.is_empty() {
                None
            } else {
                let ancestor = math::lowest_common_ancestor(
                    self.own_leaf_index,
                    *leaf_index,
                    self.tree.leaf_count(),
                )?;
                path_update
                    .path_secrets
                    .iter()
                    .find(|(index, _)| *index == ancestor)
                    .map(|(_, secret)| secret.as_secret().clone())
            };
            let group_secrets = GroupSecrets {
                joiner_secret: schedule.joiner_secret.clone(),
                path_secret,
            };
            let sealed = suite.encrypt_with_label(
                key_package.init_key(),
                "Welcome",
                &encrypted_group_info,
                &group_secrets.to_bytes()?,
                rng,
            )?;
            secrets.push(EncryptedGroupSecrets {
                new_member: key_package.hash_ref()?,
                encrypted_group_secrets: sealed,
            });
        }

        Ok(Welcome {
            cipher_suite: suite,
            secrets,
            encrypted_group_info,
        })
    }
}

/// Apply proposals to a diff in order: adds take the first blank leaf (growing the tree when
/// full) and are recorded as unmerged on their path; removes blank the leaf and its path.
fn apply_proposals(
    diff: &mut TreeDiff<'_>,
    suite: CipherSuite,
    proposals: &[Proposal],
    used_key_package_refs: &[Vec<u8>],
) -> Result<AppliedProposals, GroupError> {
    let mut joiners = Vec::new();
    let mut new_refs: Vec<Vec<u8>> = Vec::new();

    for proposal in proposals {
        match proposal {
            Proposal::Add(add) => {
                let key_package = &add.key_package;
                key_package.verify(suite)?;

                let reference = key_package.hash_ref()?;
                let seen = used_key_package_refs.contains(&reference)
                    || new_refs.contains(&reference);
                if seen && !key_package.is_last_resort() {
                    return Err(GroupError::ReusedKeyPackage);
                }

                let index = match diff.free_leaf() {
                    Some(index) => index,
                    None => {
                        diff.grow();
                        diff.free_leaf().expect("grown tree has blank leaves")
                    }
                };
                diff.replace_leaf(index, key_package.leaf_node().clone())?;
                diff.add_unmerged_leaf(index)?;

                joiners.push((index, key_package.clone()));
                new_refs.push(reference);
            }
            Proposal::Remove(remove) => {
                if diff.leaf(remove.removed).is_none() {
                    return Err(GroupError::UnknownMember);
                }
                diff.blank_leaf(remove.removed)?;
                diff.blank_path(remove.removed)?;
            }
        }
    }

    Ok(AppliedProposals { joiners, new_refs })
}

impl Encode for Group {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.suite.encode(buffer)?;
        self.group_id.encode(buffer)?;
        self.epoch.encode(buffer)?;
        self.tree.encode(buffer)?;
        self.context_extensions.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, &self.confirmed_transcript_hash)?;
        encode_var_bytes(buffer, VarWidth::U8, &self.interim_transcript_hash)?;
        self.epoch_secrets.encode(buffer)?;
        self.own_leaf_index.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, self.signature_secret.as_bytes())?;

        (self.node_secrets.len() as u32).encode(buffer)?;
        for (index, secret) in &self.node_secrets {
            index.encode(buffer)?;
            encode_var_bytes(buffer, VarWidth::U8, secret.as_bytes())?;
        }

        (self.used_key_package_refs.len() as u32).encode(buffer)?;
        for reference in &self.used_key_package_refs {
            encode_var_bytes(buffer, VarWidth::U8, reference)?;
        }
        Ok(())
    }
}

impl Decode for Group {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let suite = CipherSuite::decode(cursor)?;
        let group_id = GroupId::decode(cursor)?;
        let epoch = u64::decode(cursor)?;
        let tree = RatchetTree::decode(cursor)?;
        let context_extensions = Vec::decode(cursor)?;
        let confirmed_transcript_hash = decode_var_bytes(cursor, VarWidth::U8)?;
        let interim_transcript_hash = decode_var_bytes(cursor, VarWidth::U8)?;
        let epoch_secrets = EpochSecrets::decode(cursor)?;
        let own_leaf_index = LeafIndex::decode(cursor)?;
        let signature_secret = decode_var_bytes(cursor, VarWidth::U8)?;

        let count = u32::decode(cursor)? as usize;
        let mut node_secrets = BTreeMap::new();
        for _ in 0..count {
            let index = u32::decode(cursor)?;
            let secret = decode_var_bytes(cursor, VarWidth::U8)?;
            node_secrets.insert(
                index,
                SecretKey::from_bytes(secret.try_into().map_err(|_| CodecError::InvalidLength)?),
            );
        }

        let count = u32::decode(cursor)? as usize;
        let mut used_key_package_refs = Vec::with_capacity(count);
        for _ in 0..count {
            used_key_package_refs.push(decode_var_bytes(cursor, VarWidth::U8)?);
        }

        Ok(Self {
            suite,
            group_id,
            epoch,
            tree,
            context_extensions,
            confirmed_transcript_hash,
            interim_transcript_hash,
            epoch_secrets,
            own_leaf_index,
            signature_secret: SigningKey::from_bytes(
                signature_secret
                    .try_into()
                    .map_err(|_| CodecError::InvalidLength)?,
            ),
            node_secrets,
            used_key_package_refs,
        })
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("commit belongs to a different group")]
    WrongGroup,

    #[error("welcome was produced for a different cipher suite")]
    WrongSuite,

    #[error("epoch already closed by another commit")]
    EpochClosed,

    #[error("no member at the given leaf")]
    UnknownMember,

    #[error("a member cannot remove itself")]
    CannotRemoveSelf,

    #[error("this member was removed by the commit")]
    RemovedFromGroup,

    #[error("commit carries no update path")]
    MissingUpdatePath,

    #[error("welcome carries no ratchet tree")]
    MissingRatchetTree,

    #[error("welcome does not address this key package")]
    NoMatchingKeyPackage,

    #[error("key package was already used and is not last-resort")]
    ReusedKeyPackage,

    #[error("signature does not verify")]
    InvalidSignature,

    #[error("confirmation tag does not verify")]
    InvalidConfirmationTag,

    #[error("tree hash does not match the group context")]
    InvalidTreeHash,

    #[error(transparent)]
    KeyPackage(#[from] KeyPackageError),

    #[error(transparent)]
    LeafNode(#[from] LeafNodeError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    TreeKem(#[from] TreeKemError),

    #[error(transparent)]
    KeySchedule(#[from] KeyScheduleError),

    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Math(#[from] TreeMathError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use crate::ciphersuite::CipherSuite;
    use crate::codec::{Decode, Encode};
    use crate::credential::Credential;
    use crate::crypto::Rng;
    use crate::key_package::KeyPackageBundle;
    use crate::tree::math::LeafIndex;

    use super::{Group, GroupError, GroupId};

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    fn bundle(identity: &[u8], rng: &Rng) -> KeyPackageBundle {
        KeyPackageBundle::generate(SUITE, Credential::basic(identity.to_vec()), Vec::new(), rng)
            .unwrap()
    }

    fn new_group(rng: &Rng) -> Group {
        Group::create(
            SUITE,
            bundle(b"alice", rng),
            GroupId::from_bytes(b"coffee club".to_vec()),
            Vec::new(),
            rng,
        )
        .unwrap()
    }

    #[test]
    fn two_member_group_agrees_on_exported_secrets() {
        let rng = Rng::from_seed([1; 32]);
        let mut alice = new_group(&rng);

        let bob_bundle = bundle(b"bob", &rng);
        let bob_key_package = bob_bundle.key_package().clone();

        let (welcome, _commit) = alice.add_member(bob_key_package, &rng).unwrap();
        let bob = Group::process_welcome(SUITE, bob_bundle, &welcome).unwrap();

        assert_eq!(alice.epoch(), 1);
        assert_eq!(bob.epoch(), 1);
        assert_eq!(bob.own_leaf_index(), LeafIndex::new(1));
        assert_eq!(alice.members().len(), 2);
        assert_eq!(alice.members(), bob.members());

        let alice_export = alice.export_secret("nostr", b"", 32).unwrap();
        let bob_export = bob.export_secret("nostr", b"", 32).unwrap();
        assert_eq!(alice_export, bob_export);
    }

    #[test]
    fn commits_fan_out_to_all_members() {
        let rng = Rng::from_seed([2; 32]);
        let mut alice = new_group(&rng);

        // Bob joins via welcome.
        let bob_bundle = bundle(b"bob", &rng);
        let (welcome, _) = alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        let mut bob = Group::process_welcome(SUITE, bob_bundle, &welcome).unwrap();

        // Charlie joins next; bob processes the commit.
        let charlie_bundle = bundle(b"charlie", &rng);
        let (welcome, commit) = alice
            .add_member(charlie_bundle.key_package().clone(), &rng)
            .unwrap();
        bob.process_commit(&commit).unwrap();
        let mut charlie = Group::process_welcome(SUITE, charlie_bundle, &welcome).unwrap();

        assert_eq!(alice.epoch(), 2);
        assert_eq!(bob.epoch(), 2);
        assert_eq!(charlie.epoch(), 2);
        for group in [&alice, &bob, &charlie] {
            assert_eq!(
                group.export_secret("nostr", b"session", 32).unwrap(),
                alice.export_secret("nostr", b"session", 32).unwrap()
            );
        }

        // An update from bob reaches everyone.
        let commit = bob.update(&rng).unwrap();
        alice.process_commit(&commit).unwrap();
        charlie.process_commit(&commit).unwrap();
        assert_eq!(
            alice.export_secret("nostr", b"", 32).unwrap(),
            bob.export_secret("nostr", b"", 32).unwrap()
        );
        assert_eq!(
            alice.export_secret("nostr", b"", 32).unwrap(),
            charlie.export_secret("nostr", b"", 32).unwrap()
        );
    }

    #[test]
    fn removed_member_is_locked_out() {
        let rng = Rng::from_seed([3; 32]);
        let mut alice = new_group(&rng);

        let bob_bundle = bundle(b"bob", &rng);
        let (welcome, _) = alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        let mut bob = Group::process_welcome(SUITE, bob_bundle, &welcome).unwrap();

        let charlie_bundle = bundle(b"charlie", &rng);
        let (welcome, commit) = alice
            .add_member(charlie_bundle.key_package().clone(), &rng)
            .unwrap();
        bob.process_commit(&commit).unwrap();
        let mut charlie = Group::process_welcome(SUITE, charlie_bundle, &welcome).unwrap();

        let commit = alice.remove_member(LeafIndex::new(1), &rng).unwrap();
        assert!(matches!(
            bob.process_commit(&commit),
            Err(GroupError::RemovedFromGroup)
        ));
        charlie.process_commit(&commit).unwrap();

        assert_eq!(alice.members().len(), 2);
        assert_eq!(
            alice.export_secret("nostr", b"", 32).unwrap(),
            charlie.export_secret("nostr", b"", 32).unwrap()
        );

        // Bob's stale state cannot follow the group forward.
        assert_ne!(
            bob.export_secret("nostr", b"", 32).unwrap(),
            alice.export_secret("nostr", b"", 32).unwrap()
        );
    }

    #[test]
    fn one_commit_per_epoch() {
        let rng = Rng::from_seed([4; 32]);
        let mut alice = new_group(&rng);

        let bob_bundle = bundle(b"bob", &rng);
        let (welcome, _) = alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        let mut bob = Group::process_welcome(SUITE, bob_bundle, &welcome).unwrap();

        let commit = alice.update(&rng).unwrap();
        bob.process_commit(&commit).unwrap();

        // Replaying the commit, or the committer processing its own commit, hits the closed
        // epoch.
        assert!(matches!(
            bob.process_commit(&commit),
            Err(GroupError::EpochClosed)
        ));
        assert!(matches!(
            alice.process_commit(&commit),
            Err(GroupError::EpochClosed)
        ));
    }

    #[test]
    fn key_packages_are_single_use() {
        let rng = Rng::from_seed([5; 32]);
        let mut alice = new_group(&rng);

        let bob_bundle = bundle(b"bob", &rng);
        let (_, _) = alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        assert!(matches!(
            alice.add_member(bob_bundle.key_package().clone(), &rng),
            Err(GroupError::ReusedKeyPackage)
        ));
    }

    #[test]
    fn cannot_remove_self_or_unknown_members() {
        let rng = Rng::from_seed([6; 32]);
        let mut alice = new_group(&rng);

        assert!(matches!(
            alice.remove_member(LeafIndex::new(0), &rng),
            Err(GroupError::CannotRemoveSelf)
        ));
        assert!(matches!(
            alice.remove_member(LeafIndex::new(5), &rng),
            Err(GroupError::UnknownMember)
        ));
    }

    #[test]
    fn persisted_state_round_trip() {
        let rng = Rng::from_seed([7; 32]);
        let mut alice = new_group(&rng);

        let bob_bundle = bundle(b"bob", &rng);
        let (welcome, _) = alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        let bob = Group::process_welcome(SUITE, bob_bundle, &welcome).unwrap();

        let bytes = alice.to_bytes().unwrap();
        let mut restored = Group::from_bytes(&bytes).unwrap();

        assert_eq!(restored.epoch(), alice.epoch());
        assert_eq!(restored.group_id(), alice.group_id());
        assert_eq!(restored.members(), alice.members());
        assert_eq!(
            restored.export_secret("nostr", b"", 32).unwrap(),
            alice.export_secret("nostr", b"", 32).unwrap()
        );

        // The restored handle keeps working: a fresh commit still reaches bob's replica.
        let mut bob = bob;
        let commit = restored.update(&rng).unwrap();
        bob.process_commit(&commit).unwrap();
        assert_eq!(
            restored.export_secret("nostr", b"", 32).unwrap(),
            bob.export_secret("nostr", b"", 32).unwrap()
        );
    }

    #[test]
    fn epochs_have_distinct_exporters() {
        let rng = Rng::from_seed([8; 32]);
        let mut alice = new_group(&rng);

        let epoch_0 = alice.export_secret("nostr", b"", 32).unwrap();
        let bob_bundle = bundle(b"bob", &rng);
        alice
            .add_member(bob_bundle.key_package().clone(), &rng)
            .unwrap();
        let epoch_1 = alice.export_secret("nostr", b"", 32).unwrap();
        alice.update(&rng).unwrap();
        let epoch_2 = alice.export_secret("nostr", b"", 32).unwrap();

        assert_ne!(epoch_0, epoch_1);
        assert_ne!(epoch_1, epoch_2);
    }
}
