// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 key pairs used as HPKE encryption keys at tree leaves and parent nodes.
use libcrux::ecdh::Algorithm;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

const ALGORITHM: Algorithm = Algorithm::X25519;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key, kept by exactly one holder and zeroed on drop.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        SecretKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    pub fn public_key(&self) -> Result<PublicKey, X25519Error> {
        let bytes = libcrux::ecdh::secret_to_public(ALGORITHM, self.0)
            .map_err(|_| X25519Error::InvalidCurve)?;
        Ok(PublicKey(
            bytes
                .try_into()
                .expect("correct public key size from ecdh method"),
        ))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not reveal the secret scalar when printing debug info.
        f.debug_struct("SecretKey").field("value", &"***").finish()
    }
}

/// X25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(public_key)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("invalid curve point or scalar")]
    InvalidCurve,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::SecretKey;

    #[test]
    fn public_key_is_deterministic() {
        let rng = Rng::from_seed([3; 32]);

        let secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        assert_eq!(
            secret_key.public_key().unwrap(),
            secret_key.public_key().unwrap()
        );
    }

    #[test]
    fn clamping() {
        let secret_key = SecretKey::from_bytes([255; 32]);
        let bytes = secret_key.as_bytes();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }
}
