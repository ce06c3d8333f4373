// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hashed Message Authentication Code (HMAC) with SHA256, used for the per-epoch confirmation
//! tag.
//!
//! <https://www.rfc-editor.org/rfc/rfc2104>
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const HMAC_SHA256_TAG_SIZE: usize = 32;

/// Compute an HMAC-SHA256 tag over a payload.
pub fn hmac_sha256(key: &[u8], payload: &[u8]) -> [u8; HMAC_SHA256_TAG_SIZE] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any size");
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn hmac_verify(key: &[u8], payload: &[u8], tag: &[u8]) -> bool {
    let expected = hmac_sha256(key, payload);
    bool::from(expected[..].ct_eq(tag))
}

#[cfg(test)]
mod tests {
    use super::{hmac_sha256, hmac_verify};

    #[test]
    fn tag_and_verify() {
        let tag = hmac_sha256(b"key", b"payload");
        assert!(hmac_verify(b"key", b"payload", &tag));

        // Any change to key, payload or tag fails verification.
        assert!(!hmac_verify(b"yek", b"payload", &tag));
        assert!(!hmac_verify(b"key", b"payload!", &tag));
        assert!(!hmac_verify(b"key", b"payload", &tag[1..]));
    }
}
