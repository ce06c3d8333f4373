// SPDX-License-Identifier: MIT OR Apache-2.0

//! Welcome messages: how a committer hands newly added members the joiner secret and enough
//! tree state to enter the new epoch.
//!
//! Per joiner, the group secrets (joiner secret plus the path secret of the joiner's lowest
//! common ancestor with the committer) are HPKE-sealed to the init key of the joiner's key
//! package. The group info (group context, ratchet tree, confirmation tag) is encrypted once,
//! under a key expanded from the welcome secret, and shared by all joiners of the commit.
use crate::ciphersuite::CipherSuite;
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::crypto::Secret;
use crate::crypto::ed25519::Signature;
use crate::crypto::hpke::HpkeCiphertext;
use crate::group::GroupContext;
use crate::leaf_node::Extension;
use crate::tree::math::LeafIndex;

/// A welcome, sent out-of-band to the members added by one commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Welcome {
    pub(crate) cipher_suite: CipherSuite,
    pub(crate) secrets: Vec<EncryptedGroupSecrets>,
    pub(crate) encrypted_group_info: Vec<u8>,
}

impl Welcome {
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }
}

/// Per-joiner entry, addressed by the joiner's key-package reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedGroupSecrets {
    pub(crate) new_member: Vec<u8>,
    pub(crate) encrypted_group_secrets: HpkeCiphertext,
}

impl Encode for Welcome {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.cipher_suite.encode(buffer)?;
        self.secrets.encode(buffer)?;
        encode_var_bytes(buffer, VarWidth::U32, &self.encrypted_group_info)
    }
}

impl Decode for Welcome {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            cipher_suite: CipherSuite::decode(cursor)?,
            secrets: Vec::decode(cursor)?,
            encrypted_group_info: decode_var_bytes(cursor, VarWidth::U32)?,
        })
    }
}

impl Encode for EncryptedGroupSecrets {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, &self.new_member)?;
        self.encrypted_group_secrets.encode(buffer)
    }
}

impl Decode for EncryptedGroupSecrets {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            new_member: decode_var_bytes(cursor, VarWidth::U8)?,
            encrypted_group_secrets: HpkeCiphertext::decode(cursor)?,
        })
    }
}

/// The secrets sealed to one joiner.
#[derive(Debug)]
pub(crate) struct GroupSecrets {
    pub(crate) joiner_secret: Secret,
    pub(crate) path_secret: Option<Secret>,
}

impl Encode for GroupSecrets {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_var_bytes(buffer, VarWidth::U8, self.joiner_secret.as_bytes())?;
        match &self.path_secret {
            None => 0u8.encode(buffer),
            Some(secret) => {
                1u8.encode(buffer)?;
                encode_var_bytes(buffer, VarWidth::U8, secret.as_bytes())
            }
        }
    }
}

impl Decode for GroupSecrets {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let joiner_secret = Secret::from_bytes(decode_var_bytes(cursor, VarWidth::U8)?);
        let path_secret = match u8::decode(cursor)? {
            0 => None,
            1 => Some(Secret::from_bytes(decode_var_bytes(cursor, VarWidth::U8)?)),
            other => return Err(CodecError::InvalidDiscriminant(other as u32)),
        };
        Ok(Self {
            joiner_secret,
            path_secret,
        })
    }
}

/// The shared group state of a welcome, signed by the committer and encrypted under the welcome
/// secret.
#[derive(Clone, Debug)]
pub(crate) struct GroupInfo {
    pub(crate) group_context: GroupContext,
    pub(crate) extensions: Vec<Extension>,
    pub(crate) confirmation_tag: Vec<u8>,
    pub(crate) signer: LeafIndex,
    pub(crate) signature: Signature,
}

impl GroupInfo {
    pub(crate) fn to_be_signed(&self) -> Result<Vec<u8>, CodecError> {
        let mut tbs = Vec::new();
        self.group_context.encode(&mut tbs)?;
        self.extensions.encode(&mut tbs)?;
        encode_var_bytes(&mut tbs, VarWidth::U8, &self.confirmation_tag)?;
        self.signer.encode(&mut tbs)?;
        Ok(tbs)
    }
}

impl Encode for GroupInfo {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        buffer.extend_from_slice(&self.to_be_signed()?);
        encode_var_bytes(buffer, VarWidth::U8, self.signature.as_bytes())
    }
}

impl Decode for GroupInfo {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let group_context = GroupContext::decode(cursor)?;
        let extensions = Vec::decode(cursor)?;
        let confirmation_tag = decode_var_bytes(cursor, VarWidth::U8)?;
        let signer = LeafIndex::decode(cursor)?;
        let signature = decode_var_bytes(cursor, VarWidth::U8)?;
        Ok(Self {
            group_context,
            extensions,
            confirmation_tag,
            signer,
            signature: Signature::from_bytes(
                signature.try_into().map_err(|_| CodecError::InvalidLength)?,
            ),
        })
    }
}
