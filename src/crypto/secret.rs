// SPDX-License-Identifier: MIT OR Apache-2.0

#[cfg(not(test))]
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Generic container for sensitive bytes with best-effort security measures.
///
/// In particular this implementation provides:
/// 1. Zeroise memory on drop.
/// 2. Crate-private API methods to retrieve bytes, preventing misuse.
/// 3. Hide bytes value when printing debug info.
/// 4. Constant-time comparison implementation to prevent timing attacks.
///
/// Unlike a fixed-size container the length is chosen at runtime, since the hash output length
/// `Nh` (and with it the size of every derived secret) depends on the active cipher suite.
///
/// This represents a "best-effort" attempt, since side-channels are ultimately a property of a
/// deployed cryptographic system including the hardware it runs on, not just of software.
#[derive(Clone, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug))]
pub struct Secret(#[serde(with = "serde_bytes")] Vec<u8>);

impl Secret {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// All-zero secret of the given length, used as the "absent" input of key-schedule slots.
    pub(crate) fn zero(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison.
        bool::from(self.0.ct_eq(&other.0))
    }
}

#[cfg(not(test))]
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal secret values when printing debug info.
        f.debug_struct("Secret").field("value", &"***").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn constant_time_equality() {
        let secret_1 = Secret::from_bytes(vec![1, 2, 3, 4]);
        let secret_2 = Secret::from_bytes(vec![1, 2, 3, 4]);
        let secret_3 = Secret::from_bytes(vec![1, 2, 3, 5]);
        let secret_4 = Secret::from_bytes(vec![1, 2, 3]);

        assert_eq!(secret_1, secret_2);
        assert_ne!(secret_1, secret_3);
        assert_ne!(secret_1, secret_4);
    }

    #[test]
    fn zero_secret() {
        assert_eq!(Secret::zero(32).as_bytes(), &[0u8; 32]);
    }
}
