// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cipher-suite façade binding a suite identifier to its hash, KDF, signature scheme and HPKE
//! parameters, and exposing the labeled constructions every other subsystem derives from.
//!
//! All eight IANA-registered suites are enumerated; the subset backed by the HPKE implementation
//! (DHKEM-X25519 with SHA256 and Ed25519) is reported via [`CipherSuite::is_supported`].
//! Operations on any other suite fail with [`CipherSuiteError::UnsupportedSuite`].
//!
//! <https://www.rfc-editor.org/rfc/rfc9420#section-17.1>
use libcrux::aead::Algorithm;
use libcrux::hpke::aead::AEAD;
use thiserror::Error;

use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, encode_var_bytes};
use crate::crypto::ed25519::{Ed25519Error, Signature, SigningKey, VerifyingKey};
use crate::crypto::hkdf::{HkdfError, hkdf_expand, hkdf_extract};
use crate::crypto::hpke::{HpkeCiphertext, HpkeError, derive_key_pair, hpke_open, hpke_seal};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError, Secret};

/// Every label is prefixed with this ASCII constant before it enters a KDF or signature
/// construction.
const LABEL_PREFIX: &str = "MLS 1.0 ";

/// MLS cipher suites as registered with IANA.
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipherSuite {
    MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519 = 0x0001,
    MLS_128_DHKEMP256_AES128GCM_SHA256_P256 = 0x0002,
    MLS_128_DHKEMX25519_CHACHA20POLY1305_SHA256_Ed25519 = 0x0003,
    MLS_256_DHKEMX448_AES256GCM_SHA512_Ed448 = 0x0004,
    MLS_256_DHKEMP521_AES256GCM_SHA512_P521 = 0x0005,
    MLS_256_DHKEMX448_CHACHA20POLY1305_SHA512_Ed448 = 0x0006,
    MLS_256_DHKEMP384_AES256GCM_SHA384_P384 = 0x0007,
    MLS_256_XWING_CHACHA20POLY1305_SHA256_Ed25519 = 0x004D,
}

/// Concrete algorithm choices of a supported suite.
struct SuiteParams {
    hpke_aead: AEAD,
    aead: Algorithm,
    aead_key_length: usize,
}

impl CipherSuite {
    /// Returns true if the HPKE backend implements this suite.
    pub fn is_supported(&self) -> bool {
        self.params().is_some()
    }

    /// Hash output length `Nh` in bytes. Defined for every registered suite.
    pub fn hash_length(&self) -> usize {
        match self {
            CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519
            | CipherSuite::MLS_128_DHKEMP256_AES128GCM_SHA256_P256
            | CipherSuite::MLS_128_DHKEMX25519_CHACHA20POLY1305_SHA256_Ed25519
            | CipherSuite::MLS_256_XWING_CHACHA20POLY1305_SHA256_Ed25519 => 32,
            CipherSuite::MLS_256_DHKEMP384_AES256GCM_SHA384_P384 => 48,
            CipherSuite::MLS_256_DHKEMX448_AES256GCM_SHA512_Ed448
            | CipherSuite::MLS_256_DHKEMP521_AES256GCM_SHA512_P521
            | CipherSuite::MLS_256_DHKEMX448_CHACHA20POLY1305_SHA512_Ed448 => 64,
        }
    }

    /// AEAD key length `Nk` in bytes.
    pub fn aead_key_length(&self) -> Result<usize, CipherSuiteError> {
        Ok(self.supported_params()?.aead_key_length)
    }

    /// AEAD nonce length `Nn` in bytes.
    pub fn aead_nonce_length(&self) -> usize {
        crate::crypto::aead::AEAD_NONCE_SIZE
    }

    fn params(&self) -> Option<SuiteParams> {
        match self {
            CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519 => Some(SuiteParams {
                hpke_aead: AEAD::AES_128_GCM,
                aead: Algorithm::Aes128Gcm,
                aead_key_length: 16,
            }),
            CipherSuite::MLS_128_DHKEMX25519_CHACHA20POLY1305_SHA256_Ed25519 => {
                Some(SuiteParams {
                    hpke_aead: AEAD::ChaCha20Poly1305,
                    aead: Algorithm::Chacha20Poly1305,
                    aead_key_length: 32,
                })
            }
            _ => None,
        }
    }

    fn supported_params(&self) -> Result<SuiteParams, CipherSuiteError> {
        self.params()
            .ok_or(CipherSuiteError::UnsupportedSuite(*self as u16))
    }

    /// Hash a payload with the suite hash function.
    pub fn hash(&self, payload: &[u8]) -> Result<Vec<u8>, CipherSuiteError> {
        self.supported_params()?;
        Ok(sha2_256(payload).to_vec())
    }

    /// `HKDF-Extract` with the suite hash function.
    pub fn extract(&self, salt: &[u8], ikm: &[u8]) -> Result<Secret, CipherSuiteError> {
        self.supported_params()?;
        Ok(Secret::from_bytes(hkdf_extract(salt, ikm).to_vec()))
    }

    /// `ExpandWithLabel(secret, label, context, length)`: HKDF-Expand with the label run through
    /// the KDF label structure (prefixed label with a `u8` length, context with a `u32` length).
    pub fn expand_with_label(
        &self,
        secret: &Secret,
        label: &str,
        context: &[u8],
        length: usize,
    ) -> Result<Secret, CipherSuiteError> {
        self.supported_params()?;
        let info = kdf_label(label, context, length)?;
        let okm = hkdf_expand(secret.as_bytes(), &info, length)?;
        Ok(Secret::from_bytes(okm))
    }

    /// `DeriveSecret(secret, label)` = `ExpandWithLabel(secret, label, "", Nh)`.
    pub fn derive_secret(&self, secret: &Secret, label: &str) -> Result<Secret, CipherSuiteError> {
        self.expand_with_label(secret, label, b"", self.hash_length())
    }

    /// Sign content bound to a prefixed label.
    pub fn sign_with_label(
        &self,
        signing_key: &SigningKey,
        label: &str,
        content: &[u8],
    ) -> Result<Signature, CipherSuiteError> {
        self.supported_params()?;
        let payload = sign_content(label, content)?;
        Ok(signing_key.sign(&payload)?)
    }

    /// Verify a signature over content bound to a prefixed label.
    pub fn verify_with_label(
        &self,
        verifying_key: &VerifyingKey,
        label: &str,
        content: &[u8],
        signature: &Signature,
    ) -> Result<(), CipherSuiteError> {
        self.supported_params()?;
        let payload = sign_content(label, content)?;
        verifying_key
            .verify(&payload, signature)
            .map_err(|_| CipherSuiteError::InvalidSignature)
    }

    /// HPKE-seal a payload to a public key with raw `info` and `aad` strings.
    pub fn seal(
        &self,
        public_key: &PublicKey,
        info: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<HpkeCiphertext, CipherSuiteError> {
        let params = self.supported_params()?;
        Ok(hpke_seal(
            params.hpke_aead,
            public_key,
            info,
            aad,
            plaintext,
            rng,
        )?)
    }

    /// HPKE-open a payload with raw `info` and `aad` strings.
    pub fn open(
        &self,
        ciphertext: &HpkeCiphertext,
        secret_key: &SecretKey,
        info: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherSuiteError> {
        let params = self.supported_params()?;
        Ok(hpke_open(params.hpke_aead, ciphertext, secret_key, info, aad)?)
    }

    /// HPKE-seal with the encryption context structure (prefixed label and context) as `info`.
    pub fn encrypt_with_label(
        &self,
        public_key: &PublicKey,
        label: &str,
        context: &[u8],
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<HpkeCiphertext, CipherSuiteError> {
        let info = encrypt_context(label, context)?;
        self.seal(public_key, &info, b"", plaintext, rng)
    }

    /// Counterpart of [`CipherSuite::encrypt_with_label`].
    pub fn decrypt_with_label(
        &self,
        ciphertext: &HpkeCiphertext,
        secret_key: &SecretKey,
        label: &str,
        context: &[u8],
    ) -> Result<Vec<u8>, CipherSuiteError> {
        let info = encrypt_context(label, context)?;
        self.open(ciphertext, secret_key, &info, b"")
    }

    /// Hash content bound to a prefixed label (key-package references).
    pub(crate) fn hash_with_label(
        &self,
        label: &str,
        content: &[u8],
    ) -> Result<Vec<u8>, CipherSuiteError> {
        self.hash(&sign_content(label, content)?)
    }

    /// Derive a KEM key pair from a node secret.
    pub fn derive_key_pair(
        &self,
        secret: &Secret,
    ) -> Result<(SecretKey, PublicKey), CipherSuiteError> {
        self.supported_params()?;
        Ok(derive_key_pair(secret.as_bytes())?)
    }

    /// AEAD-encrypt with the suite algorithm (welcome encryption).
    pub fn aead_encrypt(
        &self,
        key: &[u8],
        plaintext: &[u8],
        nonce: crate::crypto::aead::AeadNonce,
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherSuiteError> {
        let params = self.supported_params()?;
        if key.len() != params.aead_key_length {
            return Err(CipherSuiteError::InvalidKeySize);
        }
        crate::crypto::aead::aead_encrypt(params.aead, key, plaintext, nonce, aad)
            .map_err(|_| CipherSuiteError::AeadFailure)
    }

    /// AEAD-decrypt with the suite algorithm (welcome decryption).
    pub fn aead_decrypt(
        &self,
        key: &[u8],
        ciphertext: &[u8],
        nonce: crate::crypto::aead::AeadNonce,
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherSuiteError> {
        let params = self.supported_params()?;
        if key.len() != params.aead_key_length {
            return Err(CipherSuiteError::InvalidKeySize);
        }
        crate::crypto::aead::aead_decrypt(params.aead, key, ciphertext, nonce, aad)
            .map_err(|_| CipherSuiteError::AeadFailure)
    }
}

/// `KDFLabel` info structure: output length, prefixed label, context.
fn kdf_label(label: &str, context: &[u8], length: usize) -> Result<Vec<u8>, CipherSuiteError> {
    let length = u16::try_from(length).map_err(|_| CipherSuiteError::DerivationFailure)?;
    let mut full_label = String::with_capacity(LABEL_PREFIX.len() + label.len());
    full_label.push_str(LABEL_PREFIX);
    full_label.push_str(label);

    let mut info = Vec::new();
    length.encode(&mut info)?;
    encode_var_bytes(&mut info, VarWidth::U8, full_label.as_bytes())?;
    encode_var_bytes(&mut info, VarWidth::U32, context)?;
    Ok(info)
}

/// `SignContent` payload structure: prefixed label, content.
fn sign_content(label: &str, content: &[u8]) -> Result<Vec<u8>, CipherSuiteError> {
    let mut full_label = String::with_capacity(LABEL_PREFIX.len() + label.len());
    full_label.push_str(LABEL_PREFIX);
    full_label.push_str(label);

    let mut payload = Vec::new();
    encode_var_bytes(&mut payload, VarWidth::U8, full_label.as_bytes())?;
    encode_var_bytes(&mut payload, VarWidth::U32, content)?;
    Ok(payload)
}

/// `EncryptContext` info structure for labeled HPKE: prefixed label, context.
fn encrypt_context(label: &str, context: &[u8]) -> Result<Vec<u8>, CipherSuiteError> {
    // Same layout as the signing payload.
    sign_content(label, context)
}

impl TryFrom<u16> for CipherSuite {
    type Error = CipherSuiteError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519),
            0x0002 => Ok(CipherSuite::MLS_128_DHKEMP256_AES128GCM_SHA256_P256),
            0x0003 => Ok(CipherSuite::MLS_128_DHKEMX25519_CHACHA20POLY1305_SHA256_Ed25519),
            0x0004 => Ok(CipherSuite::MLS_256_DHKEMX448_AES256GCM_SHA512_Ed448),
            0x0005 => Ok(CipherSuite::MLS_256_DHKEMP521_AES256GCM_SHA512_P521),
            0x0006 => Ok(CipherSuite::MLS_256_DHKEMX448_CHACHA20POLY1305_SHA512_Ed448),
            0x0007 => Ok(CipherSuite::MLS_256_DHKEMP384_AES256GCM_SHA384_P384),
            0x004D => Ok(CipherSuite::MLS_256_XWING_CHACHA20POLY1305_SHA256_Ed25519),
            other => Err(CipherSuiteError::UnknownSuite(other)),
        }
    }
}

impl Encode for CipherSuite {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        (*self as u16).encode(buffer)
    }
}

impl Decode for CipherSuite {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let value = u16::decode(cursor)?;
        CipherSuite::try_from(value).map_err(|_| CodecError::InvalidDiscriminant(value as u32))
    }
}

#[derive(Debug, Error)]
pub enum CipherSuiteError {
    #[error("cipher suite {0:#06x} is not registered")]
    UnknownSuite(u16),

    #[error("cipher suite {0:#06x} is not supported by this backend")]
    UnsupportedSuite(u16),

    #[error("invalid key size for suite aead")]
    InvalidKeySize,

    #[error("signature does not verify under the given label")]
    InvalidSignature,

    #[error("labeled derivation failed")]
    DerivationFailure,

    #[error("aead operation failed")]
    AeadFailure,

    #[error(transparent)]
    Signature(#[from] Ed25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Hpke(#[from] HpkeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
