// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures for tests.
use crate::ciphersuite::CipherSuite;
use crate::credential::Credential;
use crate::crypto::Rng;
use crate::crypto::ed25519::SigningKey;
use crate::crypto::x25519::SecretKey;
use crate::leaf_node::{Capabilities, LeafNode, LeafNodeSource, Lifetime};

/// A freshly signed key-package-sourced leaf together with its private keys.
pub fn leaf_with_keys(
    suite: CipherSuite,
    identity: &[u8],
    rng: &Rng,
) -> (LeafNode, SigningKey, SecretKey) {
    let signing_key = SigningKey::from_bytes(rng.random_array().unwrap());
    let encryption_secret = SecretKey::from_bytes(rng.random_array().unwrap());
    let leaf = LeafNode::new(
        suite,
        &signing_key,
        encryption_secret.public_key().unwrap(),
        Credential::basic(identity.to_vec()),
        Capabilities::default_for(suite),
        LeafNodeSource::KeyPackage(Lifetime::default_validity().unwrap()),
        Vec::new(),
        None,
    )
    .unwrap();
    (leaf, signing_key, encryption_secret)
}
