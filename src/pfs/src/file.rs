use crate::image::{Image, ReadError};
use std::cmp::min;
use std::sync::Arc;

/// A byte-range reader over one file's data.
///
/// Byte `j` of the view maps to the file's data blocks in order, so
/// fragmented files read exactly like contiguous ones.
pub struct FileView<'a> {
    image: Arc<dyn Image + 'a>,
    blocks: Vec<u32>,
    block_size: u64,
    size: u64,
}

impl<'a> FileView<'a> {
    pub(crate) fn new(
        image: Arc<dyn Image + 'a>,
        blocks: Vec<u32>,
        block_size: usize,
        size: u64,
    ) -> Self {
        Self {
            image,
            blocks,
            block_size: block_size as u64,
            size,
        }
    }
}

impl<'a> Image for FileView<'a> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let end = offset.checked_add(buf.len() as u64);

        if end.is_none() || end.unwrap() > self.size {
            return Err(ReadError::OutOfRange {
                offset,
                len: buf.len(),
            });
        }

        let mut copied = 0usize;
        let mut position = offset;

        while copied < buf.len() {
            let index = (position / self.block_size) as usize;
            let within = position % self.block_size;
            let block = match self.blocks.get(index) {
                Some(&v) => v as u64,
                None => {
                    return Err(ReadError::OutOfRange {
                        offset: position,
                        len: buf.len() - copied,
                    });
                }
            };

            let amount = min((self.block_size - within) as usize, buf.len() - copied);

            self.image
                .read(block * self.block_size + within, &mut buf[copied..(copied + amount)])?;

            copied += amount;
            position += amount as u64;
        }

        Ok(())
    }
}
