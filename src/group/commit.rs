// SPDX-License-Identifier: MIT OR Apache-2.0

//! Commit messages: the proposals they aggregate, the signed framing and the transcript-hash
//! chain that every commit extends.
use crate::ciphersuite::{CipherSuite, CipherSuiteError};
use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};
use crate::crypto::ed25519::Signature;
use crate::group::GroupId;
use crate::key_package::KeyPackage;
use crate::tree::math::LeafIndex;
use crate::treekem::UpdatePath;

/// A structural change aggregated by a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proposal {
    Add(AddProposal),
    Remove(RemoveProposal),
}

/// Adds the owner of a key package at the first blank leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddProposal {
    pub(crate) key_package: KeyPackage,
}

/// Removes the member at a leaf, blanking the leaf and its direct path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveProposal {
    pub(crate) removed: LeafIndex,
}

impl Encode for Proposal {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Proposal::Add(add) => {
                1u16.encode(buffer)?;
                add.key_package.encode(buffer)
            }
            Proposal::Remove(remove) => {
                3u16.encode(buffer)?;
                remove.removed.encode(buffer)
            }
        }
    }
}

impl Decode for Proposal {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match u16::decode(cursor)? {
            1 => Ok(Proposal::Add(AddProposal {
                key_package: KeyPackage::decode(cursor)?,
            })),
            3 => Ok(Proposal::Remove(RemoveProposal {
                removed: LeafIndex::decode(cursor)?,
            })),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

/// A commit: the aggregated proposals plus the sender's update path, framed with the sender's
/// signature over the previous group context and confirmed with a tag under the new epoch's
/// confirmation key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub(crate) group_id: GroupId,
    pub(crate) epoch: u64,
    pub(crate) sender: LeafIndex,
    pub(crate) proposals: Vec<Proposal>,
    pub(crate) path: Option<UpdatePath>,
    pub(crate) confirmation_tag: Vec<u8>,
    pub(crate) signature: Signature,
}

impl Commit {
    /// Epoch this commit was created in (one before the epoch it establishes).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn sender(&self) -> LeafIndex {
        self.sender
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// The framed content: everything except signature and confirmation tag.
    pub(crate) fn content_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::new();
        self.group_id.encode(&mut bytes)?;
        self.epoch.encode(&mut bytes)?;
        self.sender.encode(&mut bytes)?;
        self.proposals.encode(&mut bytes)?;
        self.path.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Signature input: the framed content followed by the group context of the epoch the
    /// commit was created in.
    pub(crate) fn to_be_signed(
        content_bytes: &[u8],
        group_context: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let mut tbs = Vec::new();
        encode_var_bytes(&mut tbs, VarWidth::U32, content_bytes)?;
        encode_var_bytes(&mut tbs, VarWidth::U32, group_context)?;
        Ok(tbs)
    }
}

impl Encode for Commit {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        buffer.extend_from_slice(&self.content_bytes()?);
        encode_var_bytes(buffer, VarWidth::U8, &self.confirmation_tag)?;
        encode_var_bytes(buffer, VarWidth::U8, self.signature.as_bytes())
    }
}

impl Decode for Commit {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let group_id = GroupId::decode(cursor)?;
        let epoch = u64::decode(cursor)?;
        let sender = LeafIndex::decode(cursor)?;
        let proposals = Vec::decode(cursor)?;
        let path = Option::<UpdatePath>::decode(cursor)?;
        let confirmation_tag = decode_var_bytes(cursor, VarWidth::U8)?;
        let signature = decode_var_bytes(cursor, VarWidth::U8)?;
        Ok(Self {
            group_id,
            epoch,
            sender,
            proposals,
            path,
            confirmation_tag,
            signature: Signature::from_bytes(
                signature.try_into().map_err(|_| CodecError::InvalidLength)?,
            ),
        })
    }
}

/// Extend the confirmed transcript hash with a commit's content and signature.
pub(crate) fn confirmed_transcript_hash(
    suite: CipherSuite,
    interim_transcript_hash: &[u8],
    content_bytes: &[u8],
    signature: &Signature,
) -> Result<Vec<u8>, CipherSuiteError> {
    let mut input = interim_transcript_hash.to_vec();
    encode_var_bytes(&mut input, VarWidth::U32, content_bytes)?;
    encode_var_bytes(&mut input, VarWidth::U8, signature.as_bytes())?;
    suite.hash(&input)
}

/// Extend the interim transcript hash with the new epoch's confirmation tag.
pub(crate) fn interim_transcript_hash(
    suite: CipherSuite,
    confirmed_transcript_hash: &[u8],
    confirmation_tag: &[u8],
) -> Result<Vec<u8>, CipherSuiteError> {
    let mut input = confirmed_transcript_hash.to_vec();
    encode_var_bytes(&mut input, VarWidth::U8, confirmation_tag)?;
    suite.hash(&input)
}

#[cfg(test)]
mod tests {
    use crate::ciphersuite::CipherSuite;
    use crate::codec::{Decode, Encode};
    use crate::credential::Credential;
    use crate::crypto::Rng;
    use crate::crypto::ed25519::Signature;
    use crate::group::GroupId;
    use crate::key_package::KeyPackageBundle;
    use crate::tree::math::LeafIndex;

    use super::{AddProposal, Commit, Proposal, RemoveProposal, confirmed_transcript_hash,
        interim_transcript_hash};

    const SUITE: CipherSuite = CipherSuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

    #[test]
    fn commit_round_trip() {
        let rng = Rng::from_seed([1; 32]);
        let bundle =
            KeyPackageBundle::generate(SUITE, Credential::basic(b"bob".to_vec()), Vec::new(), &rng)
                .unwrap();

        let commit = Commit {
            group_id: GroupId::from_bytes(b"group".to_vec()),
            epoch: 3,
            sender: LeafIndex::new(0),
            proposals: vec![
                Proposal::Add(AddProposal {
                    key_package: bundle.key_package().clone(),
                }),
                Proposal::Remove(RemoveProposal {
                    removed: LeafIndex::new(2),
                }),
            ],
            path: None,
            confirmation_tag: vec![7; 32],
            signature: Signature::from_bytes([9; 64]),
        };

        let bytes = commit.to_bytes().unwrap();
        assert_eq!(Commit::from_bytes(&bytes).unwrap(), commit);
    }

    #[test]
    fn transcript_hashes_chain() {
        let signature = Signature::from_bytes([1; 64]);
        let confirmed =
            confirmed_transcript_hash(SUITE, b"", b"commit content", &signature).unwrap();
        let interim = interim_transcript_hash(SUITE, &confirmed, b"tag").unwrap();

        // Deterministic and sensitive to every input.
        assert_eq!(
            confirmed,
            confirmed_transcript_hash(SUITE, b"", b"commit content", &signature).unwrap()
        );
        assert_ne!(
            confirmed,
            confirmed_transcript_hash(SUITE, &confirmed, b"commit content", &signature).unwrap()
        );
        assert_ne!(
            interim,
            interim_transcript_hash(SUITE, &confirmed, b"other tag").unwrap()
        );
    }
}
