//! The [`Deserializable`] trait, [`Cursor`] buffer, and primitive impls.

use crate::{Blob, RawVec};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur during deserialization.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Ran out of bytes before the type was fully read.
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    /// Decoded a constructor ID that doesn't match any known variant.
    #[error("unexpected constructor id: {id:#010x}")]
    UnexpectedConstructor { id: u32 },
    /// A `string` field was not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

/// Specialized `Result` for deserialization.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy cursor over an in-memory byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize { self.pos }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        match self.buf.get(self.pos).copied() {
            Some(b) => { self.pos += 1; Ok(b) }
            None    => Err(Error::UnexpectedEof),
        }
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Look at the next constructor ID without consuming it.
    pub fn peek_u32(&self) -> Result<u32> {
        let b = self.buf.get(self.pos..self.pos + 4).ok_or(Error::UnexpectedEof)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume all remaining bytes into `out`.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> usize {
        let slice = &self.buf[self.pos..];
        out.extend_from_slice(slice);
        self.pos = self.buf.len();
        slice.len()
    }
}

/// Alias used by hand-written impls: `crate::deserialize::Buffer<'_, '_>`.
pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

// ─── Deserializable ──────────────────────────────────────────────────────────

/// Deserialize a value from TL binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Deserialize from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        Self::deserialize(&mut cursor)
    }
}

/// Read a constructor ID and fail unless it equals `expected`.
pub fn expect_id(buf: Buffer, expected: u32) -> Result<()> {
    match u32::deserialize(buf)? {
        id if id == expected => Ok(()),
        id => Err(Error::UnexpectedConstructor { id }),
    }
}

// ─── Primitives ───────────────────────────────────────────────────────────────

impl Deserializable for bool {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            crate::BOOL_TRUE  => Ok(true),
            crate::BOOL_FALSE => Ok(false),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

macro_rules! le_int {
    ($($t:ty),*) => {$(
        impl Deserializable for $t {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                buf.read_exact(&mut b)?;
                Ok(<$t>::from_le_bytes(b))
            }
        }
    )*};
}

le_int!(i32, u32, i64, f64);

impl<const N: usize> Deserializable for [u8; N] {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; N];
        buf.read_exact(&mut b)?;
        Ok(b)
    }
}

// ─── Bytes / String ───────────────────────────────────────────────────────────

impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let first = buf.read_byte()?;
        let (len, header_len) = if first != 0xfe {
            (first as usize, 1)
        } else {
            let a = buf.read_byte()? as usize;
            let b = buf.read_byte()? as usize;
            let c = buf.read_byte()? as usize;
            (a | (b << 8) | (c << 16), 4)
        };

        let data = buf.take(len)?.to_vec();

        let padding = (4 - ((header_len + len) % 4)) % 4;
        buf.take(padding)?;

        Ok(data)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let bytes = Vec::<u8>::deserialize(buf)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}

// ─── Vectors ─────────────────────────────────────────────────────────────────

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_id(buf, crate::VECTOR)?;
        let len = i32::deserialize(buf)?.max(0) as usize;
        (0..len).map(|_| T::deserialize(buf)).collect()
    }
}

impl<T: Deserializable> Deserializable for RawVec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let len = i32::deserialize(buf)?.max(0) as usize;
        let inner = (0..len).map(|_| T::deserialize(buf)).collect::<Result<_>>()?;
        Ok(RawVec(inner))
    }
}

/// Takes every remaining byte.
impl Deserializable for Blob {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut out = Vec::with_capacity(buf.remaining());
        buf.read_to_end(&mut out);
        Ok(Blob(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Serializable;

    #[test]
    fn truncated_bytes_fail() {
        assert_eq!(Vec::<u8>::from_bytes(&[5, 1, 2]), Err(Error::UnexpectedEof));
    }

    #[test]
    fn wrong_vector_id() {
        let mut b = 0xdeadbeefu32.to_bytes();
        b.extend(0i32.to_bytes());
        assert_eq!(
            Vec::<i64>::from_bytes(&b),
            Err(Error::UnexpectedConstructor { id: 0xdeadbeef })
        );
    }

    #[test]
    fn peek_does_not_advance() {
        let b = 0x1234u32.to_bytes();
        let mut c = Cursor::from_slice(&b);
        assert_eq!(c.peek_u32().unwrap(), 0x1234);
        assert_eq!(c.pos(), 0);
    }
}
