//! Builders for synthetic PFS images.
//!
//! Only compiled for tests (or with the `test-image` feature) so downstream
//! crates can exercise the full stack without real console dumps.

use crate::fpt::{FlatPathTable, PathEntry};
use byteorder::{ByteOrder, LE};
use crypto::SectorCipher;

pub const BLOCK_SIZE: usize = 0x1000;

const INODE_SIZE: usize = 0xA8;
const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// What to put into the image.
pub struct ImageSpec {
    /// Files under uroot, keyed by `/`-prefixed relative path. Intermediate
    /// directories are created automatically.
    pub files: Vec<(String, Vec<u8>)>,
    pub time1_sec: u64,
    pub encryption: Option<Encryption>,
}

pub struct Encryption {
    pub ekpfs: [u8; 32],
    pub seed: [u8; 16],
}

struct NodeSpec {
    name: String,
    path: String,
    parent: usize,
    is_dir: bool,
    content: Vec<u8>,
    children: Vec<usize>,
    first_block: u32,
    block_count: u32,
}

const SUPERROOT: usize = 0;
const FPT: usize = 1;
const UROOT: usize = 2;

/// Builds a complete PFS image. Inode numbers equal node order: 0 is the
/// super-root, 1 the flat path table, 2 uroot, the rest follow insertion.
pub fn build(spec: &ImageSpec) -> Vec<u8> {
    let mut nodes = vec![
        dir_node("", "", SUPERROOT),
        file_node("flat_path_table", "", SUPERROOT, Vec::new()),
        dir_node("uroot", "", SUPERROOT),
    ];

    nodes[SUPERROOT].children = vec![FPT, UROOT];

    // Create the tree under uroot.
    for (path, content) in &spec.files {
        let mut parent = UROOT;
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

        for (i, part) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            let full: String = format!(
                "{}/{}",
                if parent == UROOT {
                    ""
                } else {
                    nodes[parent].path.as_str()
                },
                part
            );

            if let Some(existing) = nodes[parent]
                .children
                .iter()
                .copied()
                .find(|&c| nodes[c].name == *part)
            {
                assert!(!is_last, "duplicate file {path}");
                parent = existing;
                continue;
            }

            let index = nodes.len();

            if is_last {
                nodes.push(file_node(part, &full, parent, content.clone()));
            } else {
                nodes.push(dir_node(part, &full, parent));
            }

            nodes[parent].children.push(index);
            parent = index;
        }
    }

    // Build the flat path table over everything under uroot.
    let entries: Vec<PathEntry> = nodes
        .iter()
        .enumerate()
        .skip(UROOT + 1)
        .map(|(i, n)| PathEntry {
            path: n.path.clone(),
            ino: i as u64,
            is_dir: n.is_dir,
        })
        .collect();

    let (table, resolver) = FlatPathTable::build(&entries).unwrap();

    nodes[FPT].content = table.to_bytes();

    if let Some(blob) = resolver {
        let index = nodes.len();

        nodes.push(file_node("cr", "", SUPERROOT, blob));
        nodes[SUPERROOT].children.push(index);
    }

    // Directory contents: self, parent, then children in insertion order.
    for i in 0..nodes.len() {
        if !nodes[i].is_dir {
            continue;
        }

        let mut data = Vec::new();

        write_dirent(&mut data, i as u32, 4, ".");
        write_dirent(&mut data, nodes[i].parent as u32, 5, "..");

        for &child in nodes[i].children.clone().iter() {
            let ty = if nodes[child].is_dir { 3 } else { 2 };
            let name = nodes[child].name.clone();

            write_dirent(&mut data, child as u32, ty, &name);
        }

        assert!(data.len() <= BLOCK_SIZE, "directory too large for fixture");
        nodes[i].content = data;
    }

    // Allocate data blocks after the inode table.
    let inode_blocks = nodes.len().div_ceil(INODES_PER_BLOCK);
    let mut next_block = 1 + inode_blocks as u32;

    for node in &mut nodes {
        let count = if node.is_dir {
            1
        } else {
            node.content.len().div_ceil(BLOCK_SIZE)
        };

        node.first_block = next_block;
        node.block_count = count as u32;
        next_block += count as u32;
    }

    let total_blocks = next_block as usize;
    let mut image = vec![0u8; total_blocks * BLOCK_SIZE];

    // Superblock.
    {
        let hdr = &mut image[..0x380];

        LE::write_u64(&mut hdr[0x00..], 1);
        LE::write_u64(&mut hdr[0x08..], 20130315);
        LE::write_u16(
            &mut hdr[0x1c..],
            if spec.encryption.is_some() { 0x4 } else { 0x0 },
        );
        LE::write_u32(&mut hdr[0x20..], BLOCK_SIZE as u32);
        LE::write_u64(&mut hdr[0x28..], total_blocks as u64);
        LE::write_u64(&mut hdr[0x30..], nodes.len() as u64);
        LE::write_u64(&mut hdr[0x40..], inode_blocks as u64);
        LE::write_u64(&mut hdr[0x48..], SUPERROOT as u64);
        LE::write_u64(&mut hdr[0x50..], spec.time1_sec);

        if let Some(enc) = &spec.encryption {
            hdr[0x340..0x360].copy_from_slice(&crypto::seed_mac(&enc.ekpfs, &enc.seed));
            hdr[0x370..0x380].copy_from_slice(&enc.seed);
        }
    }

    // Inode table.
    for (i, node) in nodes.iter().enumerate() {
        let block = 1 + i / INODES_PER_BLOCK;
        let offset = block * BLOCK_SIZE + (i % INODES_PER_BLOCK) * INODE_SIZE;
        let inode = &mut image[offset..(offset + INODE_SIZE)];
        let size = if node.is_dir {
            BLOCK_SIZE as u64
        } else {
            node.content.len() as u64
        };

        LE::write_u16(&mut inode[0x00..], if node.is_dir { 0x41ED } else { 0x81A4 });
        LE::write_u16(&mut inode[0x02..], 1);
        LE::write_u64(&mut inode[0x08..], size);
        LE::write_u64(&mut inode[0x10..], size);
        LE::write_u32(&mut inode[0x60..], node.block_count);
        LE::write_u32(&mut inode[0x64..], node.first_block);
        LE::write_u32(&mut inode[0x68..], 0xffffffff);
    }

    // Data blocks.
    for node in &nodes {
        let offset = node.first_block as usize * BLOCK_SIZE;

        image[offset..(offset + node.content.len())].copy_from_slice(&node.content);
    }

    // Everything after the superblock gets encrypted.
    if let Some(enc) = &spec.encryption {
        let (data_key, tweak_key) = crypto::xts_keys(&enc.ekpfs, &enc.seed, false);
        let cipher = SectorCipher::new(&data_key, &tweak_key, BLOCK_SIZE);

        for num in 1..total_blocks {
            let offset = num * BLOCK_SIZE;

            cipher.encrypt_sector(num as u64, &mut image[offset..(offset + BLOCK_SIZE)]);
        }
    }

    image
}

/// Wraps a blob in a PFSC container with every sector stored raw.
pub fn wrap_pfsc(data: &[u8]) -> Vec<u8> {
    let block_size = BLOCK_SIZE as u64;
    let sectors = data.len().div_ceil(BLOCK_SIZE);
    let data_start = 0x1000u64;
    let mut out = vec![0u8; 0x30];

    LE::write_u32(&mut out[0x00..], 0x43534650);
    LE::write_u32(&mut out[0x08..], 2);
    LE::write_u32(&mut out[0x0c..], block_size as u32);
    LE::write_u64(&mut out[0x10..], block_size);
    LE::write_u64(&mut out[0x18..], 0x400);
    LE::write_u64(&mut out[0x20..], data_start);
    LE::write_u64(&mut out[0x28..], sectors as u64 * block_size);

    out.resize(0x400, 0);

    for i in 0..=sectors {
        out.extend((data_start + i as u64 * block_size).to_le_bytes());
    }

    out.resize(data_start as usize, 0);
    out.extend_from_slice(data);
    out.resize(data_start as usize + sectors * BLOCK_SIZE, 0);

    out
}

fn dir_node(name: &str, path: &str, parent: usize) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        path: path.into(),
        parent,
        is_dir: true,
        content: Vec::new(),
        children: Vec::new(),
        first_block: 0,
        block_count: 0,
    }
}

fn file_node(name: &str, path: &str, parent: usize, content: Vec<u8>) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        path: path.into(),
        parent,
        is_dir: false,
        content,
        children: Vec::new(),
        first_block: 0,
        block_count: 0,
    }
}

fn write_dirent(out: &mut Vec<u8>, ino: u32, ty: u32, name: &str) {
    let entsize = (16 + name.len() + 7) & !7;

    out.extend(ino.to_le_bytes());
    out.extend(ty.to_le_bytes());
    out.extend((name.len() as u32).to_le_bytes());
    out.extend((entsize as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend(vec![0u8; entsize - 16 - name.len()]);
}
