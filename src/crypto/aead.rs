// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated symmetric encryption with additional data (AEAD), with the algorithm selected
//! by the active cipher suite. Used to encrypt the group info inside welcome messages.
use libcrux::aead::{Algorithm, Iv, Key, Tag, decrypt_detached, encrypt_detached};
use thiserror::Error;

/// Both supported algorithms (AES-128-GCM, ChaCha20-Poly1305) use 96-bit nonces.
pub const AEAD_NONCE_SIZE: usize = 12;

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

pub fn aead_encrypt(
    algorithm: Algorithm,
    key: &[u8],
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let key = Key::from_slice(algorithm, key).map_err(AeadError::InvalidArgument)?;
    let nonce = Iv::new(nonce).map_err(AeadError::InvalidArgument)?;

    let (tag, mut ciphertext) =
        encrypt_detached(&key, plaintext, nonce, aad).map_err(AeadError::Encrypt)?;

    // Attach authenticated tag to the end of ciphertext.
    ciphertext.extend_from_slice(tag.as_ref());

    Ok(ciphertext)
}

pub fn aead_decrypt(
    algorithm: Algorithm,
    key: &[u8],
    ciphertext_tag: &[u8],
    nonce: AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if ciphertext_tag.len() < algorithm.tag_size() {
        return Err(AeadError::InvalidArgument(libcrux::aead::Error::InvalidTag));
    }

    // Extract authenticated tag from the end of ciphertext.
    let boundary = ciphertext_tag.len() - algorithm.tag_size();
    let ciphertext = &ciphertext_tag[..boundary];
    let tag = &ciphertext_tag[boundary..];

    let key = Key::from_slice(algorithm, key).map_err(AeadError::InvalidArgument)?;
    let nonce = Iv::new(nonce).map_err(AeadError::InvalidArgument)?;
    let tag = Tag::from_slice(tag).map_err(AeadError::InvalidArgument)?;

    let plaintext =
        decrypt_detached(&key, ciphertext, nonce, aad, &tag).map_err(AeadError::Decrypt)?;

    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("invalid aead argument: {0:?}")]
    InvalidArgument(libcrux::aead::Error),

    #[error("could not encrypt with aead: {0:?}")]
    Encrypt(libcrux::aead::Error),

    #[error("could not decrypt with aead: {0:?}")]
    Decrypt(libcrux::aead::Error),
}
