// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edwards-Curve Digital Signature Algorithm (EdDSA) related to Curve25519 using SHA-512.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const SIGNING_KEY_SIZE: usize = 32;
pub const VERIFYING_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 signing key, kept by exactly one holder and zeroed on drop.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SigningKey([u8; SIGNING_KEY_SIZE]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        SigningKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNING_KEY_SIZE] {
        &self.0
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let mut bytes = [0u8; VERIFYING_KEY_SIZE];
        libcrux_ed25519::secret_to_public(&mut bytes, &self.0);
        VerifyingKey(bytes)
    }

    pub fn sign(&self, bytes: &[u8]) -> Result<Signature, Ed25519Error> {
        let bytes =
            libcrux_ed25519::sign(bytes, &self.0).map_err(|_| Ed25519Error::SigningFailed)?;
        Ok(Signature(bytes))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the secret scalar when printing debug info.
        f.debug_struct("SigningKey").field("value", &"***").finish()
    }
}

/// Ed25519 verifying (public) key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey([u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), Ed25519Error> {
        libcrux_ed25519::verify(bytes, &self.0, &signature.0)
            .map_err(|_| Ed25519Error::VerificationFailed)?;
        Ok(())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

/// 512-bit Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum Ed25519Error {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("could not sign payload")]
    SigningFailed,
}
