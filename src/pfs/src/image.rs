use crypto::SectorCipher;
use std::cmp::min;
use std::sync::Arc;
use thiserror::Error;
use util::new_buffer;

/// Random-access source of PFS bytes.
///
/// Implementations decrypt or decompress transparently so the rest of the
/// crate only ever sees plaintext image offsets.
pub trait Image {
    fn size(&self) -> u64;

    /// Fill `buf` from data at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError>;
}

impl<T: Image + ?Sized> Image for &T {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        (**self).read(offset, buf)
    }
}

impl<T: Image + ?Sized> Image for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        (**self).read(offset, buf)
    }
}

/// A plaintext image.
pub struct Unencrypted<'raw> {
    raw: &'raw [u8],
}

impl<'raw> Unencrypted<'raw> {
    pub fn new(raw: &'raw [u8]) -> Self {
        Self { raw }
    }
}

impl<'raw> Image for Unencrypted<'raw> {
    fn size(&self) -> u64 {
        self.raw.len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let start: usize = offset.try_into().map_err(|_| ReadError::OutOfRange {
            offset,
            len: buf.len(),
        })?;

        let data = start
            .checked_add(buf.len())
            .and_then(|end| self.raw.get(start..end))
            .ok_or(ReadError::OutOfRange {
                offset,
                len: buf.len(),
            })?;

        buf.copy_from_slice(data);

        Ok(())
    }
}

/// An XTS-encrypted image. The sector size equals the PFS block size and the
/// first block (the superblock) is never encrypted.
pub struct Encrypted<'raw> {
    raw: &'raw [u8],
    cipher: SectorCipher,
    block_size: usize,
}

impl<'raw> Encrypted<'raw> {
    const ENCRYPTED_START: u64 = 1;

    pub fn new(
        raw: &'raw [u8],
        data_key: &[u8; 16],
        tweak_key: &[u8; 16],
        block_size: usize,
    ) -> Self {
        Self {
            raw,
            cipher: SectorCipher::new(data_key, tweak_key, block_size),
            block_size,
        }
    }

    /// This method always read the whole block, so `buf` is always filled.
    fn read_block(&self, num: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let offset = num * self.block_size as u64;
        let start: usize = offset.try_into().map_err(|_| ReadError::OutOfRange {
            offset,
            len: buf.len(),
        })?;

        let data = start
            .checked_add(self.block_size)
            .and_then(|end| self.raw.get(start..end))
            .ok_or(ReadError::OutOfRange {
                offset,
                len: self.block_size,
            })?;

        buf.copy_from_slice(data);

        if num >= Self::ENCRYPTED_START {
            self.cipher.decrypt_sector(num, buf);
        }

        Ok(())
    }
}

impl<'raw> Image for Encrypted<'raw> {
    fn size(&self) -> u64 {
        self.raw.len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        if buf.is_empty() {
            return Ok(());
        }

        let block_size = self.block_size as u64;
        let mut block_data = new_buffer(self.block_size);
        let mut block_num = offset / block_size;
        let mut copied = 0usize;

        while copied < buf.len() {
            self.read_block(block_num, &mut block_data)?;

            // Copy the window of the block that overlaps the request.
            let start = if copied == 0 {
                (offset % block_size) as usize
            } else {
                0
            };

            let amount = min(self.block_size - start, buf.len() - copied);

            buf[copied..(copied + amount)].copy_from_slice(&block_data[start..(start + amount)]);
            copied += amount;
            block_num += 1;
        }

        Ok(())
    }
}

/// Errors for reading from an [`Image`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("read of {len} bytes at {offset:#x} is out of range")]
    OutOfRange { offset: u64, len: usize },

    #[error("sector #{0} is corrupted")]
    BadSector(u64),
}
