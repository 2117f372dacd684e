use self::dirent::Dirent;
use self::header::Header;
use self::image::{Encrypted, Image, Unencrypted};
use self::inode::Inode;
use std::sync::Arc;
use thiserror::Error;
use util::new_buffer;

pub mod fpt;
pub mod header;
pub mod image;
pub mod inode;
pub mod pfsc;

mod dirent;
mod file;
mod tree;

#[cfg(any(test, feature = "test-image"))]
pub mod testimg;


pub use file::FileView;
pub use tree::{Node, NodeKind, Tree, COLLISION_RESOLVER, FLAT_PATH_TABLE, UROOT};

/// Opens a PFS image, decrypting blocks on demand when the superblock says
/// the image is encrypted.
pub fn open<'a>(
    raw: &'a [u8],
    flags: ImageFlags,
    ekpfs: Option<&[u8]>,
) -> Result<Pfs<'a>, OpenError> {
    let header = Header::read(raw).map_err(OpenError::InvalidHeader)?;

    if !header.mode().is_encrypted() {
        return Pfs::from_image(Arc::new(Unencrypted::new(raw)), header);
    }

    let ekpfs = ekpfs.ok_or(OpenError::NoDecryptionKey)?;
    let (data_key, tweak_key) = crypto::xts_keys(ekpfs, header.key_seed(), flags.is_new_encryption());

    open_with_keys(raw, &data_key, &tweak_key)
}

/// Opens an encrypted PFS image with explicit XTS keys.
pub fn open_with_keys<'a>(
    raw: &'a [u8],
    data_key: &[u8; 16],
    tweak_key: &[u8; 16],
) -> Result<Pfs<'a>, OpenError> {
    let header = Header::read(raw).map_err(OpenError::InvalidHeader)?;
    let block_size = header.block_size();
    let image = Encrypted::new(raw, data_key, tweak_key, block_size);

    Pfs::from_image(Arc::new(image), header)
}

/// Opens a PFS whose bytes come through an existing [`Image`], e.g. a PFSC
/// decompressor. The image must already be plaintext.
pub fn open_image<'a>(image: Arc<dyn Image + 'a>) -> Result<Pfs<'a>, OpenError> {
    let mut raw = new_buffer(header::HEADER_SIZE);

    image
        .read(0, &mut raw)
        .map_err(|e| OpenError::ReadBlockFailed(0, e))?;

    let header = Header::read(&raw).map_err(OpenError::InvalidHeader)?;

    Pfs::from_image(image, header)
}

/// Verifies an EKPFS against the MAC embedded in the superblock.
pub fn check_ekpfs(raw: &[u8], ekpfs: &[u8]) -> Result<bool, header::ReadError> {
    let header = Header::read(raw)?;

    Ok(&crypto::seed_mac(ekpfs, header.key_seed()) == header.seed_mac())
}

/// An open PFS image with its inode table loaded.
pub struct Pfs<'a> {
    image: Arc<dyn Image + 'a>,
    header: Header,
    inodes: Vec<Inode>,
}

impl<'a> Pfs<'a> {
    fn from_image(image: Arc<dyn Image + 'a>, header: Header) -> Result<Self, OpenError> {
        let mut pfs = Self {
            inodes: Vec::with_capacity(header.inode_count()),
            image,
            header,
        };

        for block_num in 0..pfs.header.inode_block_count() {
            if pfs.load_inodes(block_num)? {
                break;
            }
        }

        if pfs.inodes.len() != pfs.header.inode_count() {
            return Err(OpenError::MissingInodes(pfs.inodes.len()));
        }

        Ok(pfs)
    }

    /// `block_num` is a number of inode block, not image block. The first
    /// inode block always start at image second block.
    fn load_inodes(&mut self, block_num: u32) -> Result<bool, OpenError> {
        let block_size = self.header.block_size();
        let offset = (block_size as u64) * (1 + block_num as u64);
        let mut block_data = new_buffer(block_size);

        self.image
            .read(offset, &mut block_data)
            .map_err(|e| OpenError::ReadBlockFailed(block_num + 1, e))?;

        // Read inodes in the block.
        let mut src = block_data.as_slice();
        let reader = if self.header.mode().is_signed() {
            Inode::read_signed
        } else {
            Inode::read_unsigned
        };

        while self.inodes.len() < self.header.inode_count() {
            match reader(self.inodes.len(), &mut src) {
                Ok(v) => self.inodes.push(v),
                Err(inode::ReadError::TooSmall) => return Ok(false),
            }
        }

        Ok(true)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn image(&self) -> &Arc<dyn Image + 'a> {
        &self.image
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub fn inode(&self, num: usize) -> Option<&Inode> {
        self.inodes.get(num)
    }

    /// A byte-range reader over the file at `num`.
    pub fn file_view(&self, num: usize) -> Result<FileView<'a>, FileViewError> {
        let inode = self.inodes.get(num).ok_or(FileViewError::InvalidInode(num))?;
        let blocks = inode
            .load_blocks(&*self.image, self.header.block_size())
            .map_err(|e| FileViewError::LoadBlocksFailed(num, e))?;

        Ok(FileView::new(
            self.image.clone(),
            blocks,
            self.header.block_size(),
            inode.size(),
        ))
    }

    /// Reads one directory's entries in on-disk order, skipping the self
    /// and parent records.
    fn read_dir(&self, num: usize) -> Result<Vec<(usize, u32, String)>, WalkError> {
        let inode = self.inodes.get(num).ok_or(WalkError::InvalidInode(num))?;
        let block_size = self.header.block_size();
        let blocks = inode
            .load_blocks(&*self.image, block_size)
            .map_err(|e| WalkError::LoadBlocksFailed(num, e))?;

        let mut entries = Vec::new();
        let mut block_data = new_buffer(block_size);

        for block_num in blocks {
            let offset = (block_num as u64) * (block_size as u64);

            self.image
                .read(offset, &mut block_data)
                .map_err(|e| WalkError::ReadBlockFailed(block_num, e))?;

            let mut next = block_data.as_slice();

            loop {
                let dirent = match Dirent::read(&mut next) {
                    Ok(v) => v,
                    Err(dirent::ReadError::TooSmall) | Err(dirent::ReadError::EndOfEntry) => break,
                    Err(dirent::ReadError::InvalidSize) => {
                        return Err(WalkError::InvalidDirent { block: block_num });
                    }
                };

                match dirent.ty() {
                    Dirent::FILE | Dirent::DIRECTORY => {}
                    Dirent::SELF | Dirent::PARENT => continue,
                    _ => return Err(WalkError::UnknownDirent { block: block_num }),
                }

                let name = std::str::from_utf8(dirent.name())
                    .map_err(|_| WalkError::NonUtf8Name(dirent.inode()))?
                    .to_owned();

                entries.push((dirent.inode(), dirent.ty(), name));
            }
        }

        Ok(entries)
    }

    /// Builds the directory tree rooted at the super-root.
    ///
    /// The super-root must contain `uroot` and `flat_path_table`.
    pub fn build_tree(&self) -> Result<Tree, WalkError> {
        let superroot_ino = self.header.super_root_inode();
        let mut nodes = vec![Node {
            name: String::new(),
            ino: superroot_ino,
            parent: None,
            kind: NodeKind::Directory {
                children: Vec::new(),
            },
        }];

        // Breadth-first walk, children in dirent order.
        let mut queue = std::collections::VecDeque::from([0usize]);

        while let Some(dir) = queue.pop_front() {
            let dir_ino = nodes[dir].ino;

            for (ino, ty, name) in self.read_dir(dir_ino)? {
                let inode = self.inodes.get(ino).ok_or(WalkError::InvalidInode(ino))?;
                let index = nodes.len();
                let kind = if ty == Dirent::DIRECTORY {
                    NodeKind::Directory {
                        children: Vec::new(),
                    }
                } else {
                    NodeKind::File {
                        size: inode.size(),
                        compressed_size: inode.compressed_size(),
                        offset: inode.first_block().unwrap_or(0) as u64
                            * self.header.block_size() as u64,
                    }
                };

                nodes.push(Node {
                    name,
                    ino,
                    parent: Some(dir),
                    kind,
                });

                if let NodeKind::Directory { children } = &mut nodes[dir].kind {
                    children.push(index);
                }

                if ty == Dirent::DIRECTORY {
                    queue.push_back(index);
                }
            }
        }

        // The super-root layout is fixed; anything else is a broken image.
        let find = |name: &str| {
            nodes
                .iter()
                .position(|n| n.parent == Some(0) && n.name == name)
        };

        find(tree::FLAT_PATH_TABLE).ok_or(WalkError::MissingFlatPathTable)?;

        let uroot = find(tree::UROOT).ok_or(WalkError::MissingUroot)?;

        if !nodes[uroot].is_directory() {
            return Err(WalkError::MissingUroot);
        }

        Ok(Tree::new(nodes, 0, uroot))
    }

    /// Parses the flat path table stored beside uroot.
    pub fn flat_path_table(&self, tree: &Tree) -> Result<fpt::FlatPathTable, FptError> {
        let index = tree
            .child(tree.superroot(), tree::FLAT_PATH_TABLE)
            .ok_or(FptError::Missing)?;
        let node = tree.node(index);
        let view = self.file_view(node.inode())?;
        let mut raw = new_buffer(view.size() as usize);

        view.read(0, &mut raw).map_err(FptError::ReadFailed)?;

        fpt::FlatPathTable::read(&raw).map_err(FptError::ParseFailed)
    }
}

/// PFS flags from the PKG header.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct ImageFlags(u64);

impl ImageFlags {
    pub fn is_new_encryption(&self) -> bool {
        self.0 & 0x2000000000000000 != 0
    }
}

impl From<u64> for ImageFlags {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Errors for opening a PFS image.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid header")]
    InvalidHeader(#[source] header::ReadError),

    #[error("the image is encrypted but no EKPFS is provided")]
    NoDecryptionKey,

    #[error("cannot read block #{0}")]
    ReadBlockFailed(u32, #[source] image::ReadError),

    #[error("inode table ends after {0} inodes")]
    MissingInodes(usize),
}

/// Errors for walking directories.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("inode #{0} is not valid")]
    InvalidInode(usize),

    #[error("cannot load occupied blocks of inode #{0}")]
    LoadBlocksFailed(usize, #[source] inode::LoadBlocksError),

    #[error("cannot read block #{0}")]
    ReadBlockFailed(u32, #[source] image::ReadError),

    #[error("block #{block} has an invalid dirent")]
    InvalidDirent { block: u32 },

    #[error("block #{block} has a dirent with unknown type")]
    UnknownDirent { block: u32 },

    #[error("inode #{0} has a non UTF-8 name")]
    NonUtf8Name(usize),

    #[error("no uroot directory under the super-root")]
    MissingUroot,

    #[error("no flat_path_table under the super-root")]
    MissingFlatPathTable,
}

/// Errors for [`file_view()`][Pfs::file_view()].
#[derive(Debug, Error)]
pub enum FileViewError {
    #[error("inode #{0} is not valid")]
    InvalidInode(usize),

    #[error("cannot load occupied blocks of inode #{0}")]
    LoadBlocksFailed(usize, #[source] inode::LoadBlocksError),
}

/// Errors for [`flat_path_table()`][Pfs::flat_path_table()].
#[derive(Debug, Error)]
pub enum FptError {
    #[error("no flat_path_table under the super-root")]
    Missing,

    #[error(transparent)]
    FileView(#[from] FileViewError),

    #[error("cannot read flat_path_table")]
    ReadFailed(#[source] image::ReadError),

    #[error("cannot parse flat_path_table")]
    ParseFailed(#[source] fpt::ReadError),
}
