//! Self-delimiting binary codec.
//!
//! Every value knows how many bytes it occupies, so a decoder never needs an
//! externally supplied length:
//!
//! - `bool`: one byte, `0` or `1`.
//! - integers: fixed-width little-endian. The width is derived once from a
//!   configured maximum (`floor(log256(max)) + 1`).
//! - `String`: a [`STRING_LEN_WIDTH`]-byte length prefix counting UTF-8 bytes,
//!   followed by the bytes.
//! - `Vec<T>`: a [`LIST_LEN_WIDTH`]-byte count prefix followed by `count`
//!   concatenated encodings of `T`.
//! - records: the concatenation of their fields in declaration order, declared
//!   with the [`record!`] macro.
//!
//! Decoding returns `(value, consumed)` and reports truncated or malformed
//! input as a [`CodecError`] rather than reading out of bounds.

use thiserror::Error;

/// Largest value a generic integer field can carry.
pub const MAX_INT: u64 = u64::MAX;

/// Longest string, in UTF-8 bytes, the codec accepts.
pub const MAX_STRING_LEN: u64 = 280;

/// Largest number of items a list may hold.
pub const MAX_LIST_LEN: u64 = u32::MAX as u64;

pub const INT_WIDTH: usize = width_for(MAX_INT);
pub const STRING_LEN_WIDTH: usize = width_for(MAX_STRING_LEN);
pub const LIST_LEN_WIDTH: usize = width_for(MAX_LIST_LEN);

/// Opcode tags and machine ids are always a single byte.
pub const TAG_WIDTH: usize = 1;

/// Number of little-endian bytes needed to hold `max`.
pub const fn width_for(max: u64) -> usize {
    let mut width = 1;
    let mut rest = max >> 8;
    while rest > 0 {
        width += 1;
        rest >>= 8;
    }
    width
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("input truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("value {value} does not fit in {width} bytes")]
    Overflow { value: u64, width: usize },

    #[error("string of {len} bytes exceeds the {max} byte limit")]
    StringTooLong { len: usize, max: u64 },

    #[error("list of {len} items exceeds the {max} item limit")]
    ListTooLong { len: usize, max: u64 },

    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    #[error("string is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

pub trait Encode {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError>;

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_to(&mut out)?;
        Ok(out)
    }
}

pub trait Decode: Sized {
    /// Decodes one value from the front of `input`, returning it together with
    /// the number of bytes it occupied.
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError>;
}

pub fn encode_uint(value: u64, width: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if width < 8 && value >> (8 * width) != 0 {
        return Err(CodecError::Overflow { value, width });
    }
    out.extend_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}

pub fn decode_uint(input: &[u8], width: usize) -> Result<u64, CodecError> {
    let bytes = take(input, width)?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

fn take(input: &[u8], needed: usize) -> Result<&[u8], CodecError> {
    input.get(..needed).ok_or(CodecError::Truncated {
        needed,
        available: input.len(),
    })
}

/// Sequential reader used by record decoders.
pub struct Cursor<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, CodecError> {
        let (value, consumed) = T::decode(&self.input[self.offset..])?;
        self.offset += consumed;
        Ok(value)
    }

    pub fn read_uint(&mut self, width: usize) -> Result<u64, CodecError> {
        let value = decode_uint(&self.input[self.offset..], width)?;
        self.offset += width;
        Ok(value)
    }

    pub fn consumed(&self) -> usize {
        self.offset
    }
}

impl Encode for bool {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        match take(input, 1)?[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl Encode for u64 {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_uint(*self, INT_WIDTH, out)
    }
}

impl Decode for u64 {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        Ok((decode_uint(input, INT_WIDTH)?, INT_WIDTH))
    }
}

impl Encode for str {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let len = self.len();
        if len as u64 > MAX_STRING_LEN {
            return Err(CodecError::StringTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        encode_uint(len as u64, STRING_LEN_WIDTH, out)?;
        out.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Encode for String {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.as_str().encode_to(out)
    }
}

impl Decode for String {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        let len = decode_uint(input, STRING_LEN_WIDTH)? as usize;
        let bytes = take(&input[STRING_LEN_WIDTH..], len)?;
        let text = std::str::from_utf8(bytes)?;
        Ok((text.to_owned(), STRING_LEN_WIDTH + len))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.as_slice().encode_to(out)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let len = self.len();
        if len as u64 > MAX_LIST_LEN {
            return Err(CodecError::ListTooLong {
                len,
                max: MAX_LIST_LEN,
            });
        }
        encode_uint(len as u64, LIST_LEN_WIDTH, out)?;
        for item in self {
            item.encode_to(out)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut cursor = Cursor::new(input);
        let count = cursor.read_uint(LIST_LEN_WIDTH)? as usize;
        // Cap the preallocation: a corrupt count must not drive a huge allocation.
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(cursor.read::<T>()?);
        }
        Ok((items, cursor.consumed()))
    }
}

/// Declares a struct whose wire form is its fields concatenated in order.
macro_rules! record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                pub $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        pub struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $crate::codec::Encode for $name {
            #[allow(unused_variables)]
            fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), $crate::codec::CodecError> {
                $( $crate::codec::Encode::encode_to(&self.$field, out)?; )*
                Ok(())
            }
        }

        impl $crate::codec::Decode for $name {
            #[allow(unused_mut)]
            fn decode(input: &[u8]) -> Result<(Self, usize), $crate::codec::CodecError> {
                let mut cursor = $crate::codec::Cursor::new(input);
                $( let $field = cursor.read::<$ty>()?; )*
                Ok((Self { $($field),* }, cursor.consumed()))
            }
        }
    };
}

pub(crate) use record;
