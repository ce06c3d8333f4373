// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key packages: the signed bundle a prospective member publishes so others can add it to a
//! group without a round trip.
//!
//! A key package carries a separate HPKE init key (used once, to encrypt the welcome secrets to
//! the joiner) next to the leaf node with its encryption key; the two must differ so
//! compromising one epoch's welcome does not reach into the tree. Producers keep the private
//! halves in a [`KeyPackageBundle`].
use thiserror::Error;

use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::credential::Credential;
use crate::crypto::ed25519::{Signature, SigningKey};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError};
use crate::leaf_node::{
    Capabilities, EXTENSION_TYPE_LAST_RESORT, Extension, LeafNode, LeafNodeError, LeafNodeSource,
    Lifetime, ProtocolVersion,
};

/// Public part of an init-key bundle, signed by the owner's signature key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPackage {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) cipher_suite: CipherSuite,
    pub(crate) init_key: PublicKey,
    pub(crate) leaf_node: LeafNode,
    pub(crate) extensions: Vec<Extension>,
    pub(crate) signature: Signature,
}

impl KeyPackage {
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn leaf_node(&self) -> &LeafNode {
        &self.leaf_node
    }

    pub fn init_key(&self) -> &PublicKey {
        &self.init_key
    }

    /// Verify both signatures and the structural invariants before using this key package to
    /// add its owner.
    pub fn verify(&self, suite: CipherSuite) -> Result<(), KeyPackageError> {
        if suite != self.cipher_suite {
            return Err(KeyPackageError::SuiteMismatch);
        }

        // Inner signature, source and lifetime of the leaf.
        self.leaf_node.verify(suite, None)?;
        match self.leaf_node.source() {
            LeafNodeSource::KeyPackage(lifetime) => lifetime.verify()?,
            _ => return Err(KeyPackageError::WrongLeafSource),
        }

        // Declared capabilities must cover the version and suite in use.
        if !self
            .leaf_node
            .capabilities()
            .supports(self.protocol_version, self.cipher_suite)
        {
            return Err(KeyPackageError::MissingCapability);
        }

        // The init key exists solely for welcome encryption.
        if self.init_key == *self.leaf_node.encryption_key() {
            return Err(KeyPackageError::InitKeyReuse);
        }

        // Outer signature over the whole package.
        let tbs = self.to_be_signed()?;
        suite
            .verify_with_label(
                self.leaf_node.signature_key(),
                "KeyPackageTBS",
                &tbs,
                &self.signature,
            )
            .map_err(|_| KeyPackageError::InvalidSignature)?;
        Ok(())
    }

    /// Reference identifying this key package, used to match welcome entries to joiners.
    pub fn hash_ref(&self) -> Result<Vec<u8>, KeyPackageError> {
        let bytes = self.to_bytes()?;
        Ok(self
            .cipher_suite
            .hash_with_label("KeyPackage Reference", &bytes)?)
    }

    /// A last-resort key package may be handed to multiple joiners; any other one is single
    /// use.
    pub fn is_last_resort(&self) -> bool {
        self.extensions
            .iter()
            .any(|extension| extension.extension_type == EXTENSION_TYPE_LAST_RESORT)
    }

    fn to_be_signed(&self) -> Result<Vec<u8>, CodecError> {
        let mut tbs = Vec::new();
        self.protocol_version.encode(&mut tbs)?;
        self.cipher_suite.encode(&mut tbs)?;
        encode_var_bytes(&mut tbs, VarWidth::U8, self.init_key.as_bytes())?;
        self.leaf_node.encode(&mut tbs)?;
        self.extensions.encode(&mut tbs)?;
        Ok(tbs)
    }
}

impl Encode for KeyPackage {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.protocol_version.encode(buffer)?;
        self.cipher_suite.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, self.init_key.as_bytes())?;
        self.leaf_node.encode(buffer)?;
        self.extensions.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U8, self.signature.as_bytes())
    }
}

impl Decode for KeyPackage {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let protocol_version = ProtocolVersion::decode(cursor)?;
        let cipher_suite = CipherSuite::decode(cursor)?;
        let init_key = decode_var_bytes(cursor, VarWidth::U8)?;
        let leaf_node = LeafNode::decode(cursor)?;
        let extensions = Vec::decode(cursor)?;
        let signature = decode_var_bytes(cursor, VarWidth::U8)?;
        Ok(Self {
            protocol_version,
            cipher_suite,
            init_key: PublicKey::from_bytes(
                init_key.try_into().map_err(|_| CodecError::InvalidLength)?,
            ),
            leaf_node,
            extensions,
            signature: Signature::from_bytes(
                signature.try_into().map_err(|_| CodecError::InvalidLength)?,
            ),
        })
    }
}

/// A key package together with the private init, encryption and signature keys of its owner.
#[derive(Debug)]
pub struct KeyPackageBundle {
    pub(crate) key_package: KeyPackage,
    pub(crate) init_secret: SecretKey,
    pub(crate) encryption_secret: SecretKey,
    pub(crate) signature_secret: SigningKey,
}

impl KeyPackageBundle {
    /// Generate fresh signature, init and encryption key pairs and assemble a signed key
    /// package around them.
    pub fn generate(
        suite: CipherSuite,
        credential: Credential,
        extensions: Vec<Extension>,
        rng: &Rng,
    ) -> Result<Self, KeyPackageError> {
        let signature_secret = SigningKey::from_bytes(rng.random_array()?);
        let init_secret = SecretKey::from_bytes(rng.random_array()?);
        let encryption_secret = SecretKey::from_bytes(rng.random_array()?);

        let leaf_node = LeafNode::new(
            suite,
            &signature_secret,
            encryption_secret.public_key()?,
            credential,
            Capabilities::default_for(suite),
            LeafNodeSource::KeyPackage(Lifetime::default_validity()?),
            Vec::new(),
            None,
        )?;

        let mut key_package = KeyPackage {
            protocol_version: ProtocolVersion::Mls10,
            cipher_suite: suite,
            init_key: init_secret.public_key()?,
            leaf_node,
            extensions,
            signature: Signature::from_bytes([0; 64]),
        };
        let tbs = key_package.to_be_signed()?;
        key_package.signature = suite.sign_with_label(&signature_secret, "KeyPackageTBS", &tbs)?;

        Ok(Self {
            key_package,
            init_secret,
            encryption_secret,
            signature_secret,
        })
    }

    pub fn key_package(&self) -> &KeyPackage {
        &self.key_package
    }
}

#[derive(Debug, Error)]
pub enum KeyPackageError {
    #[error("key package was issued for a different cipher suite")]
    SuiteMismatch,

    #[error("key package signature does not verify")]
    InvalidSignature,

    #[error("leaf node was not produced for a key package")]
    WrongLeafSource,

    #[error("capabilities do not cover the protocol version or cipher suite")]
    MissingCapability,

    #[error("init key and leaf encryption key must differ")]
    InitKeyReuse,

    #[error(transparent)]
    LeafNode(#[from] LeafNodeError),

    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Rng(#[from] RngError),
}
