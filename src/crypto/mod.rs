// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core cryptographic algorithms and random number generator.
//!
//! Algorithms:
//! - DHKEM-X25519 HPKE (path and welcome secret transport)
//! - SHA256 HKDF (labeled key derivation)
//! - SHA256 HMAC (confirmation tags)
//! - AES-128-GCM and ChaCha20-Poly1305 AEAD (welcome encryption)
//! - Ed25519 (SHA512) DSA (leaf node, key package and group info signatures)
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded via `getrandom`
pub mod aead;
pub mod ed25519;
pub mod hkdf;
pub mod hmac;
pub mod hpke;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
