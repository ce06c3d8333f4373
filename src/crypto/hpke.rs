// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid Public Key Encryption (HPKE) in base mode with DHKEM-X25519 and HKDF-SHA256, used to
//! transport path secrets along the tree and joiner secrets inside welcomes.
//!
//! <https://www.rfc-editor.org/rfc/rfc9180>
use libcrux::hpke::{HPKEConfig, HpkeOpen, HpkeSeal, Mode, aead, errors, kdf, kem};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf_expand, hkdf_extract};
use crate::crypto::x25519::{PublicKey, SECRET_KEY_SIZE, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError};

const KEM: kem::KEM = kem::KEM::DHKEM_X25519_HKDF_SHA256;
const KDF: kdf::KDF = kdf::KDF::HKDF_SHA256;

/// KEM suite identifier of DHKEM(X25519, HKDF-SHA256), bound into the key-derivation labels.
const KEM_SUITE_ID: [u8; 5] = [b'K', b'E', b'M', 0x00, 0x20];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpkeCiphertext {
    /// Encapsulated, shared secret generated for this transaction.
    #[serde(with = "serde_bytes")]
    pub kem_output: Vec<u8>,

    /// Encrypted payload.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

fn config(aead: aead::AEAD) -> HPKEConfig {
    HPKEConfig(Mode::mode_base, KEM, KDF, aead)
}

/// Encrypt a secret payload to a public key using HPKE.
///
/// The sender uses the KEM to generate the shared secret as well as its encapsulation. The shared
/// secret is run through the HPKE key schedule and used in the given AEAD to encrypt the payload,
/// bound to `info` and `aad`.
pub fn hpke_seal(
    aead: aead::AEAD,
    public_key: &PublicKey,
    info: &[u8],
    aad: &[u8],
    plaintext: &[u8],
    rng: &Rng,
) -> Result<HpkeCiphertext, HpkeError> {
    let randomness = rng.random_vec(kem::Nsk(KEM))?;
    let libcrux::hpke::HPKECiphertext(kem_output, ciphertext) = HpkeSeal(
        config(aead),
        public_key.as_bytes(),
        info,
        aad,
        plaintext,
        None,
        None,
        None,
        randomness,
    )
    .map_err(HpkeError::Seal)?;
    Ok(HpkeCiphertext {
        kem_output,
        ciphertext,
    })
}

/// Decrypt a secret payload for a receiver holding the secret key using HPKE.
///
/// `info` and `aad` are the same as entered on the sender's side.
pub fn hpke_open(
    aead: aead::AEAD,
    input: &HpkeCiphertext,
    secret_key: &SecretKey,
    info: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, HpkeError> {
    let ciphertext =
        libcrux::hpke::HPKECiphertext(input.kem_output.to_vec(), input.ciphertext.to_vec());
    let plaintext = HpkeOpen(
        config(aead),
        &ciphertext,
        secret_key.as_bytes(),
        info,
        aad,
        None,
        None,
        None,
    )
    .map_err(HpkeError::Open)?;
    Ok(plaintext)
}

/// Deterministically derive a KEM key pair from input keying material.
///
/// Implements `DeriveKeyPair` of RFC 9180 §7.1.3 for DHKEM(X25519, HKDF-SHA256): the secret key
/// is the labeled expansion of the keying material under the KEM suite identifier.
pub fn derive_key_pair(ikm: &[u8]) -> Result<(SecretKey, PublicKey), HpkeError> {
    // dkp_prk = LabeledExtract("", "dkp_prk", ikm)
    let mut labeled_ikm = Vec::with_capacity(7 + KEM_SUITE_ID.len() + 7 + ikm.len());
    labeled_ikm.extend_from_slice(b"HPKE-v1");
    labeled_ikm.extend_from_slice(&KEM_SUITE_ID);
    labeled_ikm.extend_from_slice(b"dkp_prk");
    labeled_ikm.extend_from_slice(ikm);
    let dkp_prk = hkdf_extract(b"", &labeled_ikm);

    // sk = LabeledExpand(dkp_prk, "sk", "", Nsk)
    let mut labeled_info = Vec::with_capacity(2 + 7 + KEM_SUITE_ID.len() + 2);
    labeled_info.extend_from_slice(&(SECRET_KEY_SIZE as u16).to_be_bytes());
    labeled_info.extend_from_slice(b"HPKE-v1");
    labeled_info.extend_from_slice(&KEM_SUITE_ID);
    labeled_info.extend_from_slice(b"sk");
    let sk = hkdf_expand(&dkp_prk, &labeled_info, SECRET_KEY_SIZE)?;

    let secret_key = SecretKey::from_bytes(sk.try_into().expect("requested secret key size"));
    let public_key = secret_key.public_key()?;
    Ok((secret_key, public_key))
}

#[derive(Debug, Error)]
pub enum HpkeError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error("could not encrypt with hpke: {0:?}")]
    Seal(errors::HpkeError),

    #[error("could not decrypt with hpke: {0:?}")]
    Open(errors::HpkeError),
}

#[cfg(test)]
mod tests {
    use libcrux::hpke::aead::AEAD;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::{HpkeError, derive_key_pair, hpke_open, hpke_seal};

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);

        let secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        let public_key = secret_key.public_key().unwrap();

        let info = b"some info";
        let aad = b"some aad";
        let ciphertext = hpke_seal(
            AEAD::AES_128_GCM,
            &public_key,
            info,
            aad,
            b"path secret",
            &rng,
        )
        .unwrap();
        let plaintext = hpke_open(AEAD::AES_128_GCM, &ciphertext, &secret_key, info, aad).unwrap();

        assert_eq!(plaintext, b"path secret");
    }

    #[test]
    fn decryption_failed() {
        let rng = Rng::from_seed([1; 32]);

        let valid_secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        let public_key = valid_secret_key.public_key().unwrap();

        let info = b"some info";
        let aad = b"some aad";
        let ciphertext = hpke_seal(
            AEAD::AES_128_GCM,
            &public_key,
            info,
            aad,
            b"path secret",
            &rng,
        )
        .unwrap();

        // Invalid secret key.
        let invalid_secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        let result = hpke_open(
            AEAD::AES_128_GCM,
            &ciphertext,
            &invalid_secret_key,
            info,
            aad,
        );
        assert!(matches!(result, Err(HpkeError::Open(_))));

        // Invalid info tag.
        let result = hpke_open(AEAD::AES_128_GCM, &ciphertext, &valid_secret_key, b"", aad);
        assert!(matches!(result, Err(HpkeError::Open(_))));

        // Invalid aad.
        let result = hpke_open(AEAD::AES_128_GCM, &ciphertext, &valid_secret_key, info, b"");
        assert!(matches!(result, Err(HpkeError::Open(_))));
    }

    #[test]
    fn derived_key_pairs_are_deterministic() {
        let (secret_1, public_1) = derive_key_pair(b"node secret").unwrap();
        let (secret_2, public_2) = derive_key_pair(b"node secret").unwrap();
        let (_, public_3) = derive_key_pair(b"other node secret").unwrap();

        assert_eq!(secret_1.as_bytes(), secret_2.as_bytes());
        assert_eq!(public_1, public_2);
        assert_ne!(public_1, public_3);
    }

    #[test]
    fn seal_to_derived_key_pair() {
        let rng = Rng::from_seed([2; 32]);

        let (secret_key, public_key) = derive_key_pair(b"node secret").unwrap();
        let ciphertext = hpke_seal(
            AEAD::ChaCha20Poly1305,
            &public_key,
            b"info",
            b"",
            b"path secret",
            &rng,
        )
        .unwrap();
        let plaintext = hpke_open(
            AEAD::ChaCha20Poly1305,
            &ciphertext,
            &secret_key,
            b"info",
            b"",
        )
        .unwrap();

        assert_eq!(plaintext, b"path secret");
    }
}
