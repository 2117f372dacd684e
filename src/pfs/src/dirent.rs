use byteorder::{ByteOrder, LE};
use thiserror::Error;

const FIXED_SIZE: usize = 16;

/// One variable-length directory entry record.
pub(crate) struct Dirent {
    ino: usize,
    ty: u32,
    name: Vec<u8>,
}

impl Dirent {
    pub const FILE: u32 = 2;
    pub const DIRECTORY: u32 = 3;
    pub const SELF: u32 = 4;
    pub const PARENT: u32 = 5;

    /// Reads one record from `raw` and advances it past the record padding.
    pub fn read(raw: &mut &[u8]) -> Result<Self, ReadError> {
        let data = raw.get(..FIXED_SIZE).ok_or(ReadError::TooSmall)?;
        let entsize = LE::read_u32(&data[0x0c..]) as usize;

        if entsize == 0 {
            return Err(ReadError::EndOfEntry);
        }

        let ino = LE::read_u32(&data[0x00..]) as usize;
        let ty = LE::read_u32(&data[0x04..]);
        let namelen = LE::read_u32(&data[0x08..]) as usize;

        if entsize < FIXED_SIZE + namelen {
            return Err(ReadError::InvalidSize);
        }

        let name = raw
            .get(FIXED_SIZE..(FIXED_SIZE + namelen))
            .ok_or(ReadError::TooSmall)?
            .to_vec();

        // The padding of the last record may run to the end of the block.
        *raw = raw.get(entsize..).unwrap_or(&[]);

        Ok(Self { ino, ty, name })
    }

    pub fn inode(&self) -> usize {
        self.ino
    }

    pub fn ty(&self) -> u32 {
        self.ty
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }
}

/// Errors for [`read()`][Dirent::read()].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too small")]
    TooSmall,

    #[error("end of entry")]
    EndOfEntry,

    #[error("invalid record size")]
    InvalidSize,
}
