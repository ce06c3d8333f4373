// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-prefixed, big-endian binary codec used for every structure that crosses the wire or is
//! hashed or signed: leaf nodes, key packages, update paths, commits, welcomes and persisted
//! group state.
//!
//! Primitives:
//! - Fixed-width unsigned integers, big-endian, no padding.
//! - Variable-length byte strings with a `u8`, `u16` or `u32` length prefix selected per call
//!   site.
//! - Sequences with a `u32` element count prefix followed by the concatenated encodings.
//! - Optional values with a `u8` presence octet.
//! - Tagged unions encode their discriminator explicitly at the call site.
//!
//! Decoding is total on well-formed input: truncation, over-length prefixes and trailing garbage
//! are rejected.
use thiserror::Error;

/// Types which can be written into the binary wire representation.
pub trait Encode {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError>;

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        self.encode(&mut buffer)?;
        Ok(buffer)
    }
}

/// Types which can be read back from the binary wire representation.
pub trait Decode: Sized {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError>;

    /// Decode a value from a complete buffer, rejecting trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let value = Self::decode(&mut cursor)?;
        cursor.finish()?;
        Ok(value)
    }
}

/// Read position over a byte buffer.
#[derive(Debug)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Consume the next `length` bytes.
    pub fn take(&mut self, length: usize) -> Result<&'a [u8], CodecError> {
        if length > self.bytes.len() {
            return Err(CodecError::EndOfBuffer);
        }
        let (taken, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        Ok(taken)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Assert that the buffer has been fully consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes)
        }
    }
}

/// Width of a variable-length byte string prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarWidth {
    U8,
    U16,
    U32,
}

impl VarWidth {
    fn max_length(&self) -> usize {
        match self {
            VarWidth::U8 => u8::MAX as usize,
            VarWidth::U16 => u16::MAX as usize,
            VarWidth::U32 => u32::MAX as usize,
        }
    }
}

/// Write a byte string with the given length prefix width.
pub fn encode_var_bytes(
    buffer: &mut Vec<u8>,
    width: VarWidth,
    bytes: &[u8],
) -> Result<(), CodecError> {
    if bytes.len() > width.max_length() {
        return Err(CodecError::LengthOverflow);
    }
    match width {
        VarWidth::U8 => (bytes.len() as u8).encode(buffer)?,
        VarWidth::U16 => (bytes.len() as u16).encode(buffer)?,
        VarWidth::U32 => (bytes.len() as u32).encode(buffer)?,
    }
    buffer.extend_from_slice(bytes);
    Ok(())
}

/// Read a byte string with the given length prefix width.
pub fn decode_var_bytes(cursor: &mut Cursor<'_>, width: VarWidth) -> Result<Vec<u8>, CodecError> {
    let length = match width {
        VarWidth::U8 => u8::decode(cursor)? as usize,
        VarWidth::U16 => u16::decode(cursor)? as usize,
        VarWidth::U32 => u32::decode(cursor)? as usize,
    };
    Ok(cursor.take(length)?.to_vec())
}

macro_rules! impl_uint_codec {
    ($ty:ty) => {
        impl Encode for $ty {
            fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
                buffer.extend_from_slice(&self.to_be_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
                let bytes = cursor.take(std::mem::size_of::<$ty>())?;
                Ok(<$ty>::from_be_bytes(bytes.try_into().expect("exact size taken")))
            }
        }
    };
}

impl_uint_codec!(u8);
impl_uint_codec!(u16);
impl_uint_codec!(u32);
impl_uint_codec!(u64);

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.len() > u32::MAX as usize {
            return Err(CodecError::LengthOverflow);
        }
        (self.len() as u32).encode(buffer)?;
        for item in self {
            item.encode(buffer)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let count = u32::decode(cursor)? as usize;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(T::decode(cursor)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            None => 0u8.encode(buffer),
            Some(value) => {
                1u8.encode(buffer)?;
                value.encode(buffer)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        match u8::decode(cursor)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(cursor)?)),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,

    #[error("trailing bytes after decoding")]
    TrailingBytes,

    #[error("value too long for its length prefix")]
    LengthOverflow,

    #[error("invalid discriminant value {0}")]
    InvalidDiscriminant(u32),

    #[error("invalid length for fixed-size field")]
    InvalidLength,
}
