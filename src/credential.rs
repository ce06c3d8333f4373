// SPDX-License-Identifier: MIT OR Apache-2.0

//! Member credentials binding an application-level identity to a leaf's signature key.
//!
//! The basic credential is the only mandatory variant: an opaque identity byte string, typically
//! a public-key fingerprint chosen by the application. A certificate-chain slot is reserved for
//! forward compatibility but carries no semantics here; chains are never validated.
use thiserror::Error;

use crate::codec::{CodecError, Cursor, Decode, Encode, VarWidth, decode_var_bytes,
    encode_var_bytes};

/// Registered credential types, also advertised inside leaf-node capabilities.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CredentialType {
    Basic = 0x0001,
    X509 = 0x0002,
}

impl TryFrom<u16> for CredentialType {
    type Error = CredentialError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(CredentialType::Basic),
            0x0002 => Ok(CredentialType::X509),
            other => Err(CredentialError::UnknownCredentialType(other)),
        }
    }
}

impl Encode for CredentialType {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        (*self as u16).encode(buffer)
    }
}

impl Decode for CredentialType {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let value = u16::decode(cursor)?;
        CredentialType::try_from(value).map_err(|_| CodecError::InvalidDiscriminant(value as u32))
    }
}

/// Identity credential of a group member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Basic(BasicCredential),
    /// Reserved certificate-chain slot; each element is one DER-encoded certificate.
    X509(Vec<Vec<u8>>),
}

impl Credential {
    pub fn basic(identity: impl Into<Vec<u8>>) -> Self {
        Credential::Basic(BasicCredential {
            identity: identity.into(),
        })
    }

    pub fn credential_type(&self) -> CredentialType {
        match self {
            Credential::Basic(_) => CredentialType::Basic,
            Credential::X509(_) => CredentialType::X509,
        }
    }

    /// The opaque identity of a basic credential.
    pub fn identity(&self) -> Option<&[u8]> {
        match self {
            Credential::Basic(basic) => Some(&basic.identity),
            Credential::X509(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicCredential {
    identity: Vec<u8>,
}

impl Encode for Credential {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        self.credential_type().encode(buffer)?;
        match self {
            Credential::Basic(basic) => {
                encode_var_bytes(buffer, VarWidth::U16, &basic.identity)?;
            }
            Credential::X509(chain) => {
                if chain.len() > u32::MAX as usize {
                    return Err(CodecError::LengthOverflow);
                }
                (chain.len() as u32).encode(buffer)?;
                for certificate in chain {
                    encode_var_bytes(buffer, VarWidth::U16, certificate)?;
                }
            }
        }
        Ok(())
    }
}

impl Decode for Credential {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match CredentialType::decode(cursor)? {
            CredentialType::Basic => {
                let identity = decode_var_bytes(cursor, VarWidth::U16)?;
                Ok(Credential::Basic(BasicCredential { identity }))
            }
            CredentialType::X509 => {
                let count = u32::decode(cursor)? as usize;
                let mut chain = Vec::new();
                for _ in 0..count {
                    chain.push(decode_var_bytes(cursor, VarWidth::U16)?);
                }
                Ok(Credential::X509(chain))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown credential type {0:#06x}")]
    UnknownCredentialType(u16),
}

#[cfg(test)]
mod tests {
    use crate::codec::{Decode, Encode};

    use super::{Credential, CredentialType};

    #[test]
    fn basic_credential_round_trip() {
        let credential = Credential::basic(b"alice".to_vec());
        assert_eq!(credential.credential_type(), CredentialType::Basic);
        assert_eq!(credential.identity(), Some(&b"alice"[..]));

        let bytes = credential.to_bytes().unwrap();
        assert_eq!(Credential::from_bytes(&bytes).unwrap(), credential);
    }

    #[test]
    fn certificate_chain_round_trip() {
        let credential = Credential::X509(vec![b"leaf cert".to_vec(), b"root cert".to_vec()]);
        assert_eq!(credential.identity(), None);

        let bytes = credential.to_bytes().unwrap();
        assert_eq!(Credential::from_bytes(&bytes).unwrap(), credential);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(Credential::from_bytes(&[0x00, 0x03, 0x00, 0x00]).is_err());
    }
}
