// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA2 hashing functions.
use sha2::{Digest, Sha256, Sha512};

pub const SHA256_DIGEST_SIZE: usize = 32;

pub const SHA512_DIGEST_SIZE: usize = 64;

/// SHA2-256 hashing function.
pub fn sha2_256(payload: &[u8]) -> [u8; SHA256_DIGEST_SIZE] {
    let digest = Sha256::digest(payload);
    digest[..].try_into().expect("sha256 digest size")
}

/// SHA2-512 hashing function.
pub fn sha2_512(payload: &[u8]) -> [u8; SHA512_DIGEST_SIZE] {
    let digest = Sha512::digest(payload);
    digest[..].try_into().expect("sha512 digest size")
}

#[cfg(test)]
mod tests {
    use super::{sha2_256, sha2_512};

    #[test]
    fn digest_sizes() {
        assert_eq!(sha2_256(b"groupkem").len(), 32);
        assert_eq!(sha2_512(b"groupkem").len(), 64);
    }

    #[test]
    fn deterministic() {
        assert_eq!(sha2_256(b"payload"), sha2_256(b"payload"));
        assert_ne!(sha2_256(b"payload"), sha2_256(b"payload!"));
    }
}
