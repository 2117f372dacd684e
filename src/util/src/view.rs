use byteorder::{ByteOrder, BE, LE};
use thiserror::Error;

/// A bounded random-access window over a byte buffer.
///
/// All reads are offset-addressed and bound-checked. A sub-view created with
/// [`slice()`][View::slice()] borrows from the same buffer so its lifetime is
/// bounded by the parent.
#[derive(Clone, Copy)]
pub struct View<'a> {
    raw: &'a [u8],
}

impl<'a> View<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    pub fn len(&self) -> u64 {
        self.raw.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    /// Gets `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: u64, len: usize) -> Result<&'a [u8], ReadError> {
        let start: usize = offset
            .try_into()
            .map_err(|_| ReadError::OutOfRange { offset, len })?;

        start
            .checked_add(len)
            .and_then(|end| self.raw.get(start..end))
            .ok_or(ReadError::OutOfRange { offset, len })
    }

    /// Fills `buf` from data at `offset`.
    pub fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        buf.copy_from_slice(self.bytes(offset, buf.len())?);
        Ok(())
    }

    /// Creates a sub-view for `[offset, offset + len)`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<View<'a>, ReadError> {
        let len: usize = len.try_into().map_err(|_| ReadError::OutOfRange {
            offset,
            len: usize::MAX,
        })?;

        Ok(Self::new(self.bytes(offset, len)?))
    }

    pub fn array<const N: usize>(&self, offset: u64) -> Result<[u8; N], ReadError> {
        // The unwrap never fires: bytes() returned exactly N bytes.
        Ok(self.bytes(offset, N)?.try_into().unwrap())
    }

    pub fn u16_le(&self, offset: u64) -> Result<u16, ReadError> {
        Ok(LE::read_u16(self.bytes(offset, 2)?))
    }

    pub fn u16_be(&self, offset: u64) -> Result<u16, ReadError> {
        Ok(BE::read_u16(self.bytes(offset, 2)?))
    }

    pub fn u32_le(&self, offset: u64) -> Result<u32, ReadError> {
        Ok(LE::read_u32(self.bytes(offset, 4)?))
    }

    pub fn u32_be(&self, offset: u64) -> Result<u32, ReadError> {
        Ok(BE::read_u32(self.bytes(offset, 4)?))
    }

    pub fn u64_le(&self, offset: u64) -> Result<u64, ReadError> {
        Ok(LE::read_u64(self.bytes(offset, 8)?))
    }

    pub fn u64_be(&self, offset: u64) -> Result<u64, ReadError> {
        Ok(BE::read_u64(self.bytes(offset, 8)?))
    }
}

/// Errors for reading from a [`View`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("read of {len} bytes at {offset:#x} is out of range")]
    OutOfRange { offset: u64, len: usize },
}
