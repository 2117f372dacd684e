use crate::image::{self, Image};
use byteorder::{ByteOrder, LE};
use thiserror::Error;
use util::new_buffer;

const UNSIGNED_SIZE: usize = 0xA8;
const SIGNED_SIZE: usize = 0x2C8;

/// Marker in the second direct pointer for files stored in consecutive
/// blocks.
const CONTIGUOUS: u32 = 0xffffffff;

/// An on-disk inode. Read-only; the packer created it.
pub struct Inode {
    index: usize,
    mode: u16,
    nlink: u16,
    flags: InodeFlags,
    size: u64,
    size_compressed: u64,
    blocks: u32,
    direct_blocks: [u32; 12],
    indirect_blocks: [u32; 5],
    signed: bool,
}

impl Inode {
    /// Reads one inode from `raw` and advances it. [`ReadError::TooSmall`]
    /// signals that the remaining bytes belong to the next inode block.
    pub(crate) fn read_unsigned(index: usize, raw: &mut &[u8]) -> Result<Self, ReadError> {
        let data = raw.get(..UNSIGNED_SIZE).ok_or(ReadError::TooSmall)?;
        let mut inode = Self::read_common(index, data, false);

        // Read block pointers.
        for (i, chunk) in data[0x64..0x94].chunks_exact(4).enumerate() {
            inode.direct_blocks[i] = LE::read_u32(chunk);
        }

        for (i, chunk) in data[0x94..UNSIGNED_SIZE].chunks_exact(4).enumerate() {
            inode.indirect_blocks[i] = LE::read_u32(chunk);
        }

        *raw = &raw[UNSIGNED_SIZE..];

        Ok(inode)
    }

    /// Signed images carry a 32-byte signature in front of each block
    /// pointer.
    pub(crate) fn read_signed(index: usize, raw: &mut &[u8]) -> Result<Self, ReadError> {
        let data = raw.get(..SIGNED_SIZE).ok_or(ReadError::TooSmall)?;
        let mut inode = Self::read_common(index, data, true);

        for (i, chunk) in data[0x64..0x214].chunks_exact(36).enumerate() {
            inode.direct_blocks[i] = LE::read_u32(&chunk[32..]);
        }

        for (i, chunk) in data[0x214..SIGNED_SIZE].chunks_exact(36).enumerate() {
            inode.indirect_blocks[i] = LE::read_u32(&chunk[32..]);
        }

        *raw = &raw[SIGNED_SIZE..];

        Ok(inode)
    }

    fn read_common(index: usize, raw: &[u8], signed: bool) -> Self {
        Self {
            index,
            mode: LE::read_u16(&raw[0x00..]),
            nlink: LE::read_u16(&raw[0x02..]),
            flags: InodeFlags(LE::read_u32(&raw[0x04..])),
            size: LE::read_u64(&raw[0x08..]),
            size_compressed: LE::read_u64(&raw[0x10..]),
            blocks: LE::read_u32(&raw[0x60..]),
            direct_blocks: [0; 12],
            indirect_blocks: [0; 5],
            signed,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_directory(&self) -> bool {
        self.mode & 0xf000 == 0x4000
    }

    pub fn is_file(&self) -> bool {
        self.mode & 0xf000 == 0x8000
    }

    pub fn link_count(&self) -> u16 {
        self.nlink
    }

    pub fn flags(&self) -> InodeFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn compressed_size(&self) -> u64 {
        self.size_compressed
    }

    pub fn block_count(&self) -> u32 {
        self.blocks
    }

    /// Number of the first data block, if the inode has any.
    pub fn first_block(&self) -> Option<u32> {
        (self.blocks != 0).then_some(self.direct_blocks[0])
    }

    /// Builds the list of data blocks occupied by this inode.
    pub fn load_blocks(
        &self,
        image: &dyn Image,
        block_size: usize,
    ) -> Result<Vec<u32>, LoadBlocksError> {
        let want = self.blocks as usize;
        let mut blocks: Vec<u32> = Vec::with_capacity(want);

        if want == 0 {
            return Ok(blocks);
        }

        // Check if inode use contiguous blocks.
        if self.direct_blocks[1] == CONTIGUOUS {
            let start = self.direct_blocks[0];

            blocks.extend(start..(start + self.blocks));

            return Ok(blocks);
        }

        // Load direct pointers.
        for i in 0..12 {
            blocks.push(self.direct_blocks[i]);

            if blocks.len() == want {
                return Ok(blocks);
            }
        }

        // Load the first indirect block: a packed list of pointers.
        let mut block0 = new_buffer(block_size);

        self.read_pointer_block(image, self.indirect_blocks[0], block_size, &mut block0)?;

        let mut data = block0.as_slice();

        while let Some(i) = self.read_pointer(&mut data) {
            blocks.push(i);

            if blocks.len() == want {
                return Ok(blocks);
            }
        }

        // Second indirect level: pointers to pointer blocks.
        self.read_pointer_block(image, self.indirect_blocks[1], block_size, &mut block0)?;

        let mut block1 = new_buffer(block_size);
        let mut data0 = block0.as_slice();

        while let Some(i) = self.read_pointer(&mut data0) {
            self.read_pointer_block(image, i, block_size, &mut block1)?;

            let mut data1 = block1.as_slice();

            while let Some(j) = self.read_pointer(&mut data1) {
                blocks.push(j);

                if blocks.len() == want {
                    return Ok(blocks);
                }
            }
        }

        Err(LoadBlocksError::TooFragmented(self.index))
    }

    fn read_pointer_block(
        &self,
        image: &dyn Image,
        num: u32,
        block_size: usize,
        buf: &mut [u8],
    ) -> Result<(), LoadBlocksError> {
        let offset = num as u64 * block_size as u64;

        image
            .read(offset, buf)
            .map_err(|e| LoadBlocksError::ReadBlockFailed(num, e))
    }

    /// Pointer stride depends on whether block pointers are signed.
    fn read_pointer(&self, raw: &mut &[u8]) -> Option<u32> {
        let (record, at) = if self.signed { (36, 32) } else { (4, 0) };
        let value = LE::read_u32(raw.get(..record)?.get(at..)?);

        *raw = &raw[record..];

        Some(value)
    }
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct InodeFlags(u32);

impl InodeFlags {
    pub fn is_compressed(self) -> bool {
        self.0 & 0x00000001 != 0
    }
}

/// Errors for reading an inode from an inode block.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too small")]
    TooSmall,
}

/// Errors for [`load_blocks()`][Inode::load_blocks()].
#[derive(Debug, Error)]
pub enum LoadBlocksError {
    #[error("cannot read block #{0}")]
    ReadBlockFailed(u32, #[source] image::ReadError),

    #[error("inode #{0} spans more indirect levels than supported")]
    TooFragmented(usize),
}
