// SPDX-License-Identifier: MIT OR Apache-2.0

//! Leaf nodes: the per-member record stored at a tree leaf, carrying the member's HPKE
//! encryption key, signature key, credential, capabilities and a source discriminator, all under
//! a label-bound signature.
//!
//! The to-be-signed projection depends on the source: leaves born inside a key package are
//! signed standalone, leaves produced by an update or commit additionally bind the group
//! identifier and leaf position so a signature cannot be replayed across groups or positions.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::credential::Credential;
use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::x25519::PublicKey;
use crate::group::GroupId;
use crate::tree::math::LeafIndex;

/// Protocol versions. Only MLS 1.0 exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ProtocolVersion {
    Mls10 = 0x0001,
}

impl Encode for ProtocolVersion {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        (*self as u16).encode(buffer)
    }
}

impl Decode for ProtocolVersion {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match u16::decode(cursor)? {
            0x0001 => Ok(ProtocolVersion::Mls10),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

/// An extension: an application- or protocol-defined type with opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub extension_type: u16,
    pub extension_data: Vec<u8>,
}

/// Carries the ratchet tree inside a welcome's group info.
pub const EXTENSION_TYPE_RATCHET_TREE: u16 = 0x0002;

/// Marks a key package as reusable by multiple joiners.
pub const EXTENSION_TYPE_LAST_RESORT: u16 = 0x000A;

impl Encode for Extension {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.extension_type.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U32, &self.extension_data)
    }
}

impl Decode for Extension {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            extension_type: u16::decode(cursor)?,
            extension_data: decode_var_bytes(cursor, VarWidth::U32)?,
        })
    }
}

/// Capability advertisement of a member: the protocol versions, cipher suites, extension types,
/// proposal types and credential types it can process. Raw identifiers are kept so unknown
/// values survive a round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub versions: Vec<u16>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub proposals: Vec<u16>,
    pub credentials: Vec<u16>,
}

impl Capabilities {
    /// Default capability set for new leaves under the given suite.
    pub fn default_for(suite: CipherSuite) -> Self {
        Self {
            versions: vec![ProtocolVersion::Mls10 as u16],
            cipher_suites: vec![suite as u16],
            extensions: vec![EXTENSION_TYPE_RATCHET_TREE, EXTENSION_TYPE_LAST_RESORT],
            proposals: Vec::new(),
            credentials: vec![crate::credential::CredentialType::Basic as u16],
        }
    }

    /// A leaf must advertise the protocol version in use and the suite of its enclosing key
    /// package.
    pub fn supports(&self, version: ProtocolVersion, suite: CipherSuite) -> bool {
        self.versions.contains(&(version as u16)) && self.cipher_suites.contains(&(suite as u16))
    }
}

impl Encode for Capabilities {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.versions.encode(buffer)?;
        self.cipher_suites.encode(buffer)?;
        self.extensions.encode(buffer)?;
        self.proposals.encode(buffer)?;
        self.credentials.encode(buffer)
    }
}

impl Decode for Capabilities {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            versions: Vec::decode(cursor)?,
            cipher_suites: Vec::decode(cursor)?,
            extensions: Vec::decode(cursor)?,
            proposals: Vec::decode(cursor)?,
            credentials: Vec::decode(cursor)?,
        })
    }
}

/// Default lifetime which amounts to 3 * 28 days, i.e. about 3 months.
const DEFAULT_LIFETIME: u64 = 60 * 60 * 24 * 28 * 3;

/// The lifetime is extended into the past to allow for skewed clocks. The value is in seconds
/// and amounts to 1h.
const DEFAULT_LIFETIME_MARGIN: u64 = 60 * 60;

/// Validity window of a key-package-sourced leaf.
///
/// Receivers reject adds whose key package carries an expired leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Lifetime {
    not_before: u64,
    not_after: u64,
}

impl Lifetime {
    /// Create a new lifetime of `t` seconds from now on.
    ///
    /// Note that the lifetime is extended 1h into the past to adapt to skewed clocks, i.e.
    /// `not_before` is set to `now - 1h`.
    pub fn new(t: u64) -> Result<Self, LeafNodeError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(LeafNodeError::SystemTime)?
            .as_secs();
        Ok(Self {
            not_before: now.saturating_sub(DEFAULT_LIFETIME_MARGIN),
            not_after: now + t,
        })
    }

    pub fn default_validity() -> Result<Self, LeafNodeError> {
        Self::new(DEFAULT_LIFETIME)
    }

    /// Returns an error if the current time falls outside this lifetime.
    pub fn verify(&self) -> Result<(), LeafNodeError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(LeafNodeError::SystemTime)?
            .as_secs();
        if self.not_before < now && now < self.not_after {
            Ok(())
        } else {
            Err(LeafNodeError::ExpiredLifetime)
        }
    }

    /// Returns an error if this lifetime is over (or not yet started) `window` from now, to let
    /// producers rotate key packages before they actually expire.
    pub fn verify_with_window(&self, window: Duration) -> Result<(), LeafNodeError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(LeafNodeError::SystemTime)?
            .as_secs();
        let ahead = now + window.as_secs();
        if self.not_before < ahead && ahead < self.not_after {
            Ok(())
        } else {
            Err(LeafNodeError::ExpiredLifetime)
        }
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Lifetime {
    pub fn from_range(not_before: u64, not_after: u64) -> Self {
        Self {
            not_before,
            not_after,
        }
    }
}

impl Encode for Lifetime {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.not_before.encode(buffer)?;
        self.not_after.encode(buffer)
    }
}

impl Decode for Lifetime {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            not_before: u64::decode(cursor)?,
            not_after: u64::decode(cursor)?,
        })
    }
}

/// How a leaf entered the tree: inside a key package, via a self-update, or as part of a commit
/// path (in which case it claims a parent hash).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafNodeSource {
    KeyPackage(Lifetime),
    Update,
    Commit(Vec<u8>),
}

impl Encode for LeafNodeSource {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            LeafNodeSource::KeyPackage(lifetime) => {
                1u8.encode(buffer)?;
                lifetime.encode(buffer)
            }
            LeafNodeSource::Update => 2u8.encode(buffer),
            LeafNodeSource::Commit(parent_hash) => {
                3u8.encode(buffer)?;
                encode_var_bytes(buffer, VarWidth::U8, parent_hash)
            }
        }
    }
}

impl Decode for LeafNodeSource {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match u8::decode(cursor)? {
            1 => Ok(LeafNodeSource::KeyPackage(Lifetime::decode(cursor)?)),
            2 => Ok(LeafNodeSource::Update),
            3 => Ok(LeafNodeSource::Commit(decode_var_bytes(
                cursor,
                VarWidth::U8,
            )?)),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

/// Group binding of an update- or commit-sourced leaf signature.
#[derive(Clone, Debug)]
pub(crate) struct TreePosition {
    pub group_id: GroupId,
    pub leaf_index: LeafIndex,
}

impl Encode for TreePosition {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.group_id.encode(buffer)?;
        self.leaf_index.encode(buffer)
    }
}

/// A tree leaf: one member's keys, identity and capabilities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafNode {
    pub(crate) encryption_key: PublicKey,
    pub(crate) signature_key: VerifyingKey,
    pub(crate) credential: Credential,
    pub(crate) capabilities: Capabilities,
    pub(crate) leaf_node_source: LeafNodeSource,
    pub(crate) extensions: Vec<Extension>,
    pub(crate) signature: Signature,
}

impl LeafNode {
    /// Build and sign a leaf node.
    ///
    /// Key-package-sourced leaves are signed standalone (`tree_position` must be absent); update-
    /// and commit-sourced leaves bind their group and position (`tree_position` must be present).
    pub(crate) fn new(
        suite: CipherSuite,
        signing_key: &SigningKey,
        encryption_key: PublicKey,
        credential: Credential,
        capabilities: Capabilities,
        leaf_node_source: LeafNodeSource,
        extensions: Vec<Extension>,
        tree_position: Option<&TreePosition>,
    ) -> Result<Self, LeafNodeError> {
        let mut leaf_node = Self {
            encryption_key,
            signature_key: signing_key.verifying_key(),
            credential,
            capabilities,
            leaf_node_source,
            extensions,
            // Placeholder until the TBS is signed below.
            signature: Signature::from_bytes([0; 64]),
        };
        let tbs = leaf_node.to_be_signed(tree_position)?;
        leaf_node.signature = suite.sign_with_label(signing_key, "LeafNodeTBS", &tbs)?;
        Ok(leaf_node)
    }

    pub fn encryption_key(&self) -> &PublicKey {
        &self.encryption_key
    }

    pub fn signature_key(&self) -> &VerifyingKey {
        &self.signature_key
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn source(&self) -> &LeafNodeSource {
        &self.leaf_node_source
    }

    /// The to-be-signed projection: every field except the signature, followed by the group
    /// binding for update- and commit-sourced leaves.
    fn to_be_signed(&self, tree_position: Option<&TreePosition>) -> Result<Vec<u8>, LeafNodeError> {
        match (&self.leaf_node_source, tree_position) {
            (LeafNodeSource::KeyPackage(_), None) => {}
            (LeafNodeSource::Update | LeafNodeSource::Commit(_), Some(_)) => {}
            _ => return Err(LeafNodeError::TreePositionMismatch),
        }

        let mut tbs = Vec::new();
        encode_var_bytes(&mut tbs, VarWidth::U8, self.encryption_key.as_bytes())?;
        encode_var_bytes(&mut tbs, VarWidth::U8, self.signature_key.as_bytes())?;
        self.credential.encode(&mut tbs)?;
        self.capabilities.encode(&mut tbs)?;
        self.leaf_node_source.encode(&mut tbs)?;
        self.extensions.encode(&mut tbs)?;
        if let Some(position) = tree_position {
            position.encode(&mut tbs)?;
        }
        Ok(tbs)
    }

    /// Recompute the TBS from the declared source and check the signature against the leaf's own
    /// signature key.
    pub(crate) fn verify(
        &self,
        suite: CipherSuite,
        tree_position: Option<&TreePosition>,
    ) -> Result<(), LeafNodeError> {
        let tbs = self.to_be_signed(tree_position)?;
        suite
            .verify_with_label(&self.signature_key, "LeafNodeTBS", &tbs, &self.signature)
            .map_err(|_| LeafNodeError::InvalidSignature)?;
        Ok(())
    }
}

impl Encode for LeafNode {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, self.encryption_key.as_bytes())?;
        encode_var_bytes(buffer, VarWidth::U8, self.signature_key.as_bytes())?;
        self.credential.encode(buffer)?;
        self.capabilities.encode(buffer)?;
        self.leaf_node_source.encode(buffer)?;
        self.extensions.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, self.signature.as_bytes())
    }
}

impl Decode for LeafNode {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let encryption_key = decode_var_bytes(cursor, VarWidth::U8)?;
        let signature_key = decode_var_bytes(cursor, VarWidth::U8)?;
        let credential = Credential::decode(cursor)?;
        let capabilities = Capabilities::decode(cursor)?;
        let leaf_node_source = LeafNodeSource::decode(cursor)?;
        let extensions = Vec::decode(cursor)?;
        let signature = decode_var_bytes(cursor, VarWidth::U8)?;

        Ok(Self {
            encryption_key: PublicKey::from_bytes(
                encryption_key
                    .try_into()
                    .map_err(|_| CodecError::InvalidLength)?,
            ),
            signature_key: VerifyingKey::from_bytes(
                signature_key
                    .try_into()
                    .map_err(|_| CodecError::InvalidLength)?,
            ),
            credential,
            capabilities,
            leaf_node_source,
            extensions,
            signature: Signature::from_bytes(
                signature.try_into().map_err(|_| CodecError::InvalidLength)?,
            ),
        })
    }
}

#[derive(Debug, Error)]
pub enum LeafNodeError {
    #[error("leaf node signature does not verify")]
    InvalidSignature,

    #[error("leaf lifetime is not valid at the current time")]
    ExpiredLifetime,

    #[error("leaf source and tree position do not match")]
    TreePositionMismatch,

    #[error("leaf capabilities do not cover the group version or suite")]
    InvalidCapability,

    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    SystemTime(std::time::SystemTimeError),
}

#[cfg(test)]
mod tests {
    use crate::ciphersuite::CipherSuite;
    use crate::codec::{Decode, Encode};
    use crate::credential::Credential;
    use crate::crypto::Rng;
    use crate::crypto::ed25519::SigningKey;
    use crate::crypto::x25519::SecretKey;
    use crate::group::GroupId;
    use crate::tree::math::LeafIndex;

    use super::{
        Capabilities, LeafNode, LeafNodeError, LeafNodeSource, Lifetime, ProtocolVersion,
        TreePosition,
    };

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    fn test_leaf(rng: &Rng, source: LeafNodeSource, position: Option<&TreePosition>) -> LeafNode {
        let signing_key = SigningKey::from_bytes(rng.random_array().unwrap());
        let encryption_secret = SecretKey::from_bytes(rng.random_array().unwrap());
        LeafNode::new(
            SUITE,
            &signing_key,
            encryption_secret.public_key().unwrap(),
            Credential::basic(b"alice".to_vec()),
            Capabilities::default_for(SUITE),
            source,
            Vec::new(),
            position,
        )
        .unwrap()
    }

    #[test]
    fn key_package_leaf_round_trip() {
        let rng = Rng::from_seed([1; 32]);
        let leaf = test_leaf(
            &rng,
            LeafNodeSource::KeyPackage(Lifetime::default_validity().unwrap()),
            None,
        );

        assert!(leaf.verify(SUITE, None).is_ok());

        let bytes = leaf.to_bytes().unwrap();
        let decoded = LeafNode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, leaf);
        assert!(decoded.verify(SUITE, None).is_ok());
    }

    #[test]
    fn commit_leaf_binds_group_and_position() {
        let rng = Rng::from_seed([2; 32]);
        let position = TreePosition {
            group_id: GroupId::from_bytes(b"test group".to_vec()),
            leaf_index: LeafIndex::new(3),
        };
        let leaf = test_leaf(
            &rng,
            LeafNodeSource::Commit(b"parent hash".to_vec()),
            Some(&position),
        );

        assert!(leaf.verify(SUITE, Some(&position)).is_ok());

        // A different position invalidates the signature.
        let other_position = TreePosition {
            group_id: GroupId::from_bytes(b"test group".to_vec()),
            leaf_index: LeafIndex::new(2),
        };
        assert!(matches!(
            leaf.verify(SUITE, Some(&other_position)),
            Err(LeafNodeError::InvalidSignature)
        ));

        // Key-package verification rules cannot apply to a commit-sourced leaf.
        assert!(matches!(
            leaf.verify(SUITE, None),
            Err(LeafNodeError::TreePositionMismatch)
        ));
    }

    #[test]
    fn capabilities_must_name_version_and_suite() {
        let capabilities = Capabilities::default_for(SUITE);
        assert!(capabilities.supports(ProtocolVersion::Mls10, SUITE));
        assert!(!capabilities.supports(
            ProtocolVersion::Mls10,
            CipherSuite::MLS_128_DHKEMX25519_CHACHA20POLY1305_SHA256_Ed25519
        ));
    }

    #[test]
    fn expired_lifetime() {
        assert!(Lifetime::from_range(0, 1).verify().is_err());
        assert!(Lifetime::default_validity().unwrap().verify().is_ok());

        // A one-minute lifetime is about to expire within a two-minute window.
        let lifetime = Lifetime::new(60).unwrap();
        assert!(lifetime.verify().is_ok());
        assert!(
            lifetime
                .verify_with_window(std::time::Duration::from_secs(120))
                .is_err()
        );
    }
}
