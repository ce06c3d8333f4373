// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-epoch secret graph.
//!
//! Each commit folds the previous epoch's init secret together with the commit secret from
//! TreeKEM, and expands the result into the epoch's working secrets. Joiners enter the same
//! graph one node later, from the joiner secret they received in a welcome.
//!
//! ```plain
//! init_secret[n-1] ──┐
//!                    ├─ Extract ── DeriveSecret("joiner") ── joiner_secret
//! commit_secret ─────┘                   │
//!                      psk_secret ── Extract ──┬── DeriveSecret("welcome") ── welcome_secret
//!                                              └── ExpandWithLabel("epoch", group_context)
//!                                                        │
//!                                                   epoch_secret ── DeriveSecret(...) ── ...
//! ```
use thiserror::Error;

use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::crypto::Secret;
use crate::crypto::hmac::{hmac_sha256, hmac_verify};

/// The secrets of one epoch, each a single labeled derivation from the epoch secret.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EpochSecrets {
    pub(crate) sender_data_secret: Secret,
    pub(crate) encryption_secret: Secret,
    pub(crate) exporter_secret: Secret,
    pub(crate) external_secret: Secret,
    pub(crate) confirmation_key: Secret,
    pub(crate) membership_key: Secret,
    pub(crate) resumption_psk: Secret,
    /// Seed of the next epoch's key schedule.
    pub(crate) init_secret: Secret,
}

/// Result of one key-schedule run.
pub(crate) struct KeyScheduleOutput {
    pub(crate) joiner_secret: Secret,
    pub(crate) welcome_secret: Secret,
    pub(crate) epoch_secrets: EpochSecrets,
}

/// Advance the schedule across a commit.
///
/// Absent any pre-shared key, `psk_secret` is the all-zero string of hash length.
pub(crate) fn advance(
    suite: CipherSuite,
    init_secret: &Secret,
    commit_secret: &Secret,
    psk_secret: Option<&Secret>,
    group_context: &[u8],
) -> Result<KeyScheduleOutput, KeyScheduleError> {
    let pre_joiner = suite.extract(init_secret.as_bytes(), commit_secret.as_bytes())?;
    let joiner_secret = suite.derive_secret(&pre_joiner, "joiner")?;
    from_joiner(suite, &joiner_secret, psk_secret, group_context)
}

/// Enter the schedule from a joiner secret (welcome processing).
pub(crate) fn from_joiner(
    suite: CipherSuite,
    joiner_secret: &Secret,
    psk_secret: Option<&Secret>,
    group_context: &[u8],
) -> Result<KeyScheduleOutput, KeyScheduleError> {
    let zero_psk = Secret::zero(suite.hash_length());
    let psk_secret = psk_secret.unwrap_or(&zero_psk);

    let member_secret = suite.extract(joiner_secret.as_bytes(), psk_secret.as_bytes())?;
    let welcome_secret = suite.derive_secret(&member_secret, "welcome")?;
    let epoch_secret = suite.expand_with_label(
        &member_secret,
        "epoch",
        group_context,
        suite.hash_length(),
    )?;

    let epoch_secrets = EpochSecrets {
        sender_data_secret: suite.derive_secret(&epoch_secret, "sender data")?,
        encryption_secret: suite.derive_secret(&epoch_secret, "encryption")?,
        exporter_secret: suite.derive_secret(&epoch_secret, "exporter")?,
        external_secret: suite.derive_secret(&epoch_secret, "external")?,
        confirmation_key: suite.derive_secret(&epoch_secret, "confirm")?,
        membership_key: suite.derive_secret(&epoch_secret, "membership")?,
        resumption_psk: suite.derive_secret(&epoch_secret, "resumption")?,
        init_secret: suite.derive_secret(&epoch_secret, "init")?,
    };

    Ok(KeyScheduleOutput {
        joiner_secret: joiner_secret.clone(),
        welcome_secret,
        epoch_secrets,
    })
}

/// The exporter: the only caller-visible consumer of the exporter secret. Callers feed the
/// result into their own AEAD for out-of-band payload encryption.
pub(crate) fn export_secret(
    suite: CipherSuite,
    exporter_secret: &Secret,
    label: &str,
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>, KeyScheduleError> {
    let derived = suite.derive_secret(exporter_secret, label)?;
    let hashed_context = suite.hash(context)?;
    let exported = suite.expand_with_label(&derived, "exporter", &hashed_context, length)?;
    Ok(exported.as_bytes().to_vec())
}

/// Confirmation tag over the confirmed transcript hash.
pub(crate) fn confirmation_tag(
    confirmation_key: &Secret,
    confirmed_transcript_hash: &[u8],
) -> Vec<u8> {
    hmac_sha256(confirmation_key.as_bytes(), confirmed_transcript_hash).to_vec()
}

/// Constant-time check of a received confirmation tag.
pub(crate) fn verify_confirmation_tag(
    confirmation_key: &Secret,
    confirmed_transcript_hash: &[u8],
    tag: &[u8],
) -> bool {
    hmac_verify(confirmation_key.as_bytes(), confirmed_transcript_hash, tag)
}

impl Encode for EpochSecrets {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        for secret in [
            &self.sender_data_secret,
            &self.encryption_secret,
            &self.exporter_secret,
            &self.external_secret,
            &self.confirmation_key,
            &self.membership_key,
            &self.resumption_psk,
            &self.init_secret,
        ] {
            encode_var_bytes(buffer, VarWidth::U8, secret.as_bytes())?;
        }
        Ok(())
    }
}

impl Decode for EpochSecrets {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let mut next =
            || -> Result<Secret, CodecError> {
                Ok(Secret::from_bytes(decode_var_bytes(cursor, VarWidth::U8)?))
            };
        Ok(Self {
            sender_data_secret: next()?,
            encryption_secret: next()?,
            exporter_secret: next()?,
            external_secret: next()?,
            confirmation_key: next()?,
            membership_key: next()?,
            resumption_psk: next()?,
            init_secret: next()?,
        })
    }
}

#[derive(Debug, Error)]
pub enum KeyScheduleError {
    #[error(transparent)]
    CipherSuite(#[from] CipherSuiteError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
