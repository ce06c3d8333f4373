// SPDX-License-Identifier: MIT OR Apache-2.0

//! `groupkem` implements the core of Messaging Layer Security (MLS, RFC 9420) for secure group
//! messaging: the left-balanced ratchet tree, the TreeKEM key agreement over it, the labeled
//! cipher-suite primitives, the per-epoch key schedule and a group handle tying them together.
//!
//! The crate is deliberately scoped to group _key management_. Members derive shared secrets
//! through the exporter interface and feed them into an AEAD of their choosing; applications
//! such as Nostr event encryption (NIP-EE) encrypt their payloads out-of-band with exported
//! secrets while this crate keeps the group's keys ratcheting forward.
//!
//! ## Groups
//!
//! A [`Group`] is one member's handle over one group: it owns the ratchet tree, the current
//! epoch's secrets and the member's private keys, and it is the only legitimate mutator of
//! them. Members are added and removed through commits; each commit carries a fresh update path
//! through the tree and advances the group to the next epoch with fresh secrets, providing
//! forward secrecy and post-compromise security for the group's key material.
//!
//! ```no_run
//! use groupkem::{CipherSuite, Credential, Group, GroupId, KeyPackageBundle, Rng};
//!
//! let rng = Rng::default();
//! let suite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;
//!
//! // Everyone publishes a signed key package.
//! let alice =
//!     KeyPackageBundle::generate(suite, Credential::basic(b"alice".to_vec()), Vec::new(), &rng)?;
//! let bob =
//!     KeyPackageBundle::generate(suite, Credential::basic(b"bob".to_vec()), Vec::new(), &rng)?;
//!
//! // Alice founds a group and adds Bob; Bob joins from the welcome.
//! let group_id = GroupId::from_bytes(b"kitchen".to_vec());
//! let mut alice_group = Group::create(suite, alice, group_id, Vec::new(), &rng)?;
//! let (welcome, _commit) = alice_group.add_member(bob.key_package().clone(), &rng)?;
//! let bob_group = Group::process_welcome(suite, bob, &welcome)?;
//!
//! // Both ends export the same secret for out-of-band payload encryption.
//! let key = alice_group.export_secret("nostr", b"", 32)?;
//! assert_eq!(key, bob_group.export_secret("nostr", b"", 32)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Concurrency
//!
//! The core is single-threaded and synchronous; every operation runs to completion or fails
//! without partial state (tree edits are staged in a diff and merged atomically). Concurrent
//! commits within an epoch are resolved by whatever ordering authority the application uses:
//! the first commit wins, later ones are rejected with a closed-epoch error.
//!
//! ## Security
//!
//! Secrets (private keys, path secrets, epoch secrets) are owned by exactly one structure and
//! zeroed on drop. This is a best-effort measure; side-channels remain a property of the whole
//! deployed system. The implementation has not been independently audited.
mod ciphersuite;
mod codec;
mod credential;
mod crypto;
mod group;
mod key_package;
mod key_schedule;
mod leaf_node;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod tree;
mod treekem;

pub use ciphersuite::{CipherSuite, CipherSuiteError};
pub use codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes, encode_var_bytes};
pub use credential::{BasicCredential, Credential, CredentialError, CredentialType};
pub use crypto::{Rng, RngError};
pub use group::{
    AddProposal, Commit, Group, GroupContext, GroupError, GroupId, Member, Proposal,
    RemoveProposal, Welcome,
};
pub use key_package::{KeyPackage, KeyPackageBundle, KeyPackageError};
pub use leaf_node::{
    Capabilities, EXTENSION_TYPE_LAST_RESORT, EXTENSION_TYPE_RATCHET_TREE, Extension, LeafNode,
    LeafNodeError, LeafNodeSource, Lifetime, ProtocolVersion,
};
pub use tree::diff::{StagedDiff, TreeDiff};
pub use tree::math;
pub use tree::{Node, ParentNode, RatchetTree, TreeError};
pub use treekem::{TreeKemError, UpdatePath, UpdatePathNode};
