use crate::image::{self, Image};
use flate2::read::ZlibDecoder;
use std::cmp::min;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use thiserror::Error;
use util::new_buffer;
use util::view::View;

const MAGIC: u32 = 0x43534650; // "PFSC"
const HEADER_SIZE: usize = 0x30;

/// Compression mode values observed in the wild. Either is accepted.
const MODE_COMPRESSED: u32 = 2;
const MODE_UNCOMPRESSED: u32 = 6;

/// Random-access reader over a PFSC block container.
///
/// Presents a virtual `data_length`-byte stream; byte `i` lives in sector
/// `i / block_size`. Sectors are stored raw, deflated, or as holes,
/// depending on their length in the sector map.
pub struct Pfsc<'a> {
    image: Arc<dyn Image + 'a>,
    block_size: u64,
    data_length: u64,
    sector_map: Vec<u64>,
    mode: u32,
}

impl<'a> Pfsc<'a> {
    pub fn open(image: Arc<dyn Image + 'a>) -> Result<Self, OpenError> {
        // Read header.
        let mut hdr = [0u8; HEADER_SIZE];

        image
            .read(0, &mut hdr)
            .map_err(OpenError::ReadHeaderFailed)?;

        let hdr = View::new(&hdr);

        if hdr.u32_le(0x00).unwrap() != MAGIC {
            return Err(OpenError::InvalidMagic);
        }

        let mode = hdr.u32_le(0x08).unwrap();

        if mode != MODE_COMPRESSED && mode != MODE_UNCOMPRESSED {
            return Err(OpenError::InvalidMode(mode));
        }

        let block_size = hdr.u32_le(0x0c).unwrap() as u64;
        let block_size64 = hdr.u64_le(0x10).unwrap();
        let block_offsets = hdr.u64_le(0x18).unwrap();
        let data_start = hdr.u64_le(0x20).unwrap();
        let data_length = hdr.u64_le(0x28).unwrap();

        if block_size == 0 || block_size != block_size64 {
            return Err(OpenError::MismatchedBlockSize);
        }

        // Read the sector map.
        let count = (data_length / block_size + 1) as usize;
        let mut raw = new_buffer(count * 8);

        image
            .read(block_offsets, &mut raw)
            .map_err(OpenError::ReadSectorMapFailed)?;

        let mut sector_map = Vec::with_capacity(count);

        for chunk in raw.chunks_exact(8) {
            sector_map.push(u64::from_le_bytes(chunk.try_into().unwrap()));
        }

        // The map must start at the data area and never run backward.
        if sector_map.first() != Some(&data_start) {
            return Err(OpenError::BadSectorMap(0));
        }

        if let Some(i) = sector_map.windows(2).position(|w| w[1] < w[0]) {
            return Err(OpenError::BadSectorMap(i + 1));
        }

        Ok(Self {
            image,
            block_size,
            data_length,
            sector_map,
            mode,
        })
    }

    pub fn sector_size(&self) -> u64 {
        self.block_size
    }

    pub fn len(&self) -> u64 {
        self.data_length
    }

    pub fn is_empty(&self) -> bool {
        self.data_length == 0
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Reads one whole sector. `buf` length must equal the sector size.
    pub fn read_sector(&self, num: usize, buf: &mut [u8]) -> Result<(), ReadError> {
        assert_eq!(buf.len() as u64, self.block_size);

        let (start, end) = match (self.sector_map.get(num), self.sector_map.get(num + 1)) {
            (Some(&s), Some(&e)) => (s, e),
            _ => {
                return Err(ReadError::OutOfRange {
                    offset: num as u64 * self.block_size,
                    len: buf.len(),
                });
            }
        };

        let size = end - start;

        if size == self.block_size {
            // Stored raw.
            self.image.read(start, buf).map_err(ReadError::Image)?;
        } else if size > self.block_size {
            // A hole.
            buf.fill(0);
        } else {
            // Deflated.
            let mut compressed = new_buffer(size as usize);

            self.image
                .read(start, &mut compressed)
                .map_err(ReadError::Image)?;

            self.inflate(num, &compressed, buf)?;
        }

        Ok(())
    }

    /// Some deflate implementations return short reads before end of
    /// stream, so keep reading until the sector is full or the stream is
    /// truly done.
    fn inflate(&self, num: usize, compressed: &[u8], buf: &mut [u8]) -> Result<(), ReadError> {
        let mut decoder = ZlibDecoder::new(compressed);
        let mut filled = 0usize;

        while filled < buf.len() {
            match decoder.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Err(ReadError::DecompressionFailed(num)),
            }
        }

        if filled != buf.len() {
            return Err(ReadError::DecompressionFailed(num));
        }

        Ok(())
    }

    /// Reads an arbitrary window of the virtual stream.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let end = offset.checked_add(buf.len() as u64);

        if end.is_none() || end.unwrap() > self.data_length {
            return Err(ReadError::OutOfRange {
                offset,
                len: buf.len(),
            });
        }

        if buf.is_empty() {
            return Ok(());
        }

        let mut sector = new_buffer(self.block_size as usize);
        let mut num = (offset / self.block_size) as usize;
        let mut copied = 0usize;

        while copied < buf.len() {
            self.read_sector(num, &mut sector)?;

            let start = if copied == 0 {
                (offset % self.block_size) as usize
            } else {
                0
            };

            let amount = min(sector.len() - start, buf.len() - copied);

            buf[copied..(copied + amount)].copy_from_slice(&sector[start..(start + amount)]);
            copied += amount;
            num += 1;
        }

        Ok(())
    }
}

impl<'a> Image for Pfsc<'a> {
    fn size(&self) -> u64 {
        self.data_length
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), image::ReadError> {
        self.read_at(offset, buf).map_err(|e| match e {
            ReadError::OutOfRange { offset, len } => image::ReadError::OutOfRange { offset, len },
            ReadError::Image(v) => v,
            ReadError::DecompressionFailed(num) => image::ReadError::BadSector(num as u64),
        })
    }
}

/// Errors for [`open()`][Pfsc::open()].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot read header")]
    ReadHeaderFailed(#[source] image::ReadError),

    #[error("invalid magic")]
    InvalidMagic,

    #[error("unknown compression mode {0}")]
    InvalidMode(u32),

    #[error("block size fields do not match")]
    MismatchedBlockSize,

    #[error("cannot read sector map")]
    ReadSectorMapFailed(#[source] image::ReadError),

    #[error("sector map entry #{0} is not valid")]
    BadSectorMap(usize),
}

/// Errors for reading from a [`Pfsc`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("read of {len} bytes at {offset:#x} is out of range")]
    OutOfRange { offset: u64, len: usize },

    #[error(transparent)]
    Image(image::ReadError),

    #[error("cannot decompress sector #{0}")]
    DecompressionFailed(usize),
}
