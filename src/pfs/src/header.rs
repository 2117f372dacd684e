use std::fmt::{Display, Formatter};
use thiserror::Error;
use util::view::View;

/// Size of the on-disk superblock.
pub const HEADER_SIZE: usize = 0x380;

/// Contains PFS header.
///
/// See https://www.psdevwiki.com/ps4/PFS#Header.2FSuperblock for some basic
/// information.
pub struct Header {
    mode: Mode,
    blocksz: u32,
    ndblock: u64,
    ndinode: u64,
    ndinodeblock: u32,
    superroot_ino: u64,
    time1_sec: u64,
    seed_mac: [u8; 32],
    key_seed: [u8; 16],
}

impl Header {
    pub fn read(raw: &[u8]) -> Result<Self, ReadError> {
        if raw.len() < HEADER_SIZE {
            return Err(ReadError::TooSmall);
        }

        let raw = View::new(&raw[..HEADER_SIZE]);

        // All reads below stay inside the checked header, so unwrap is fine.
        let version = raw.u64_le(0x00).unwrap();

        if version != 1 {
            return Err(ReadError::InvalidVersion);
        }

        let format = raw.u64_le(0x08).unwrap();

        if format != 20130315 {
            return Err(ReadError::InvalidFormat);
        }

        // Read fields.
        let mode = Mode(raw.u16_le(0x1c).unwrap());
        let blocksz = raw.u32_le(0x20).unwrap();
        let ndblock = raw.u64_le(0x28).unwrap();
        let ndinode = raw.u64_le(0x30).unwrap();
        let ndinodeblock = raw.u64_le(0x40).unwrap();
        let superroot_ino = raw.u64_le(0x48).unwrap();
        let time1_sec = raw.u64_le(0x50).unwrap();
        let seed_mac = raw.array::<32>(0x340).unwrap();
        let key_seed = raw.array::<16>(0x370).unwrap();

        if ndinodeblock > (u32::MAX as u64) {
            return Err(ReadError::TooManyInodeBlocks);
        }

        Ok(Self {
            mode,
            blocksz,
            ndblock,
            ndinode,
            ndinodeblock: ndinodeblock as u32,
            superroot_ino,
            time1_sec,
            seed_mac,
            key_seed,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn block_size(&self) -> usize {
        self.blocksz as _
    }

    /// Gets a number of data blocks in the image.
    pub fn block_count(&self) -> u64 {
        self.ndblock
    }

    /// Gets a number of total inodes.
    pub fn inode_count(&self) -> usize {
        self.ndinode as _
    }

    /// Gets a number of blocks containing inode (not a number of inode).
    pub fn inode_block_count(&self) -> u32 {
        self.ndinodeblock
    }

    pub fn super_root_inode(&self) -> usize {
        self.superroot_ino as _
    }

    /// Volume creation time as UNIX seconds.
    pub fn time1_sec(&self) -> u64 {
        self.time1_sec
    }

    /// MAC over the key seed, used for EKPFS verification.
    pub fn seed_mac(&self) -> &[u8; 32] {
        &self.seed_mac
    }

    pub fn key_seed(&self) -> &[u8; 16] {
        &self.key_seed
    }
}

/// Contains PFS flags.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Mode(u16);

impl Mode {
    pub fn is_signed(&self) -> bool {
        self.0 & 0x1 != 0
    }

    pub fn is_64bits(&self) -> bool {
        self.0 & 0x2 != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & 0x4 != 0
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{:x}", self.0)?;

        let mut flags = Vec::new();

        if self.is_signed() {
            flags.push("signed");
        }

        if self.is_64bits() {
            flags.push("64-bits");
        }

        if self.is_encrypted() {
            flags.push("encrypted");
        }

        if !flags.is_empty() {
            write!(f, " ({})", flags.join(", "))?;
        }

        Ok(())
    }
}

/// Errors for [read()][Header::read()].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too small")]
    TooSmall,

    #[error("invalid version")]
    InvalidVersion,

    #[error("invalid format")]
    InvalidFormat,

    #[error("too many blocks for inodes")]
    TooManyInodeBlocks,
}
