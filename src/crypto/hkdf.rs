// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hashed Message Authentication Code (HMAC)-based key derivation function (HKDF) with SHA256,
//! split into its extract and expand phases.
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub const HKDF_SHA256_PRK_SIZE: usize = 32;

/// HKDF-Extract: condense input keying material and an optional salt into a pseudo-random key.
///
/// An empty salt is treated as absent, which RFC 5869 defines as a string of zeroes of hash
/// length.
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; HKDF_SHA256_PRK_SIZE] {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    prk.into()
}

/// HKDF-Expand: stretch a pseudo-random key into `length` bytes of output keying material.
pub fn hkdf_expand(prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, HkdfError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| HkdfError::InvalidPrkLength)?;
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidArguments)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("pseudo-random key is shorter than one hash output")]
    InvalidPrkLength,

    #[error("arguments too large for hkdf")]
    InvalidArguments,
}

#[cfg(test)]
mod tests {
    use super::{hkdf_expand, hkdf_extract};

    #[test]
    fn extract_then_expand() {
        let prk = hkdf_extract(b"salt", b"ikm");
        let okm_1 = hkdf_expand(&prk, b"info", 42).unwrap();
        let okm_2 = hkdf_expand(&prk, b"info", 42).unwrap();
        let okm_3 = hkdf_expand(&prk, b"different info", 42).unwrap();

        assert_eq!(okm_1.len(), 42);
        assert_eq!(okm_1, okm_2);
        assert_ne!(okm_2, okm_3);
    }

    #[test]
    fn salt_changes_prk() {
        assert_ne!(hkdf_extract(b"salt", b"ikm"), hkdf_extract(b"", b"ikm"));
    }

    #[test]
    fn overlong_output_rejected() {
        let prk = hkdf_extract(b"salt", b"ikm");
        // HKDF caps the output at 255 hash lengths.
        assert!(hkdf_expand(&prk, b"info", 255 * 32 + 1).is_err());
    }
}
