use byteorder::{ByteOrder, LE};
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix that marks system files and directories.
const SCE_SYS: &str = "/sce_sys";

/// Low 28 bits of a row value.
const INDEX_MASK: u32 = 0x0fffffff;

/// Size of the zero trailer after each collision list.
const LIST_TRAILER: usize = 0x18;

/// Hashes a full uroot-relative path for table lookup.
///
/// Matches the packer byte-for-byte: `h = to_upper(c) + 31 * h` over the
/// ASCII bytes of the path, so lookups are case-insensitive.
pub fn hash_path(path: &str) -> u32 {
    let mut hash: u32 = 0;

    for b in path.bytes() {
        hash = (b.to_ascii_uppercase() as u32).wrapping_add(hash.wrapping_mul(31));
    }

    hash
}

/// Node type tag stored in the top nibble of a row value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlatType {
    File = 0x0,
    Dir = 0x2,
    SceSysFile = 0x4,
    SceSysDir = 0x6,
    Collision = 0x8,
}

impl FlatType {
    fn from_nibble(v: u32) -> Result<Self, u32> {
        match v {
            0x0 => Ok(Self::File),
            0x2 => Ok(Self::Dir),
            0x4 => Ok(Self::SceSysFile),
            0x6 => Ok(Self::SceSysDir),
            0x8 => Ok(Self::Collision),
            v => Err(v),
        }
    }

    fn tag(path: &str, is_dir: bool) -> Self {
        let sys = path == SCE_SYS || path.starts_with("/sce_sys/");

        match (sys, is_dir) {
            (true, true) => Self::SceSysDir,
            (true, false) => Self::SceSysFile,
            (false, true) => Self::Dir,
            (false, false) => Self::File,
        }
    }
}

/// One parsed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub hash: u32,
    pub flat_type: FlatType,
    /// Inode number, or the collision-resolver offset for
    /// [`FlatType::Collision`].
    pub index: u32,
}

impl Row {
    fn value(&self) -> u32 {
        ((self.flat_type as u32) << 28) | self.index
    }
}

/// Input for [`FlatPathTable::build()`].
pub struct PathEntry {
    /// Full uroot-relative path with a leading `/`.
    pub path: String,
    pub ino: u64,
    pub is_dir: bool,
}

/// The hash → inode accelerator stored beside uroot.
pub struct FlatPathTable {
    rows: Vec<Row>,
}

impl FlatPathTable {
    /// Parses on-disk rows: `(hash, value)` little-endian pairs sorted by
    /// hash ascending.
    pub fn read(raw: &[u8]) -> Result<Self, ReadError> {
        if raw.len() % 8 != 0 {
            return Err(ReadError::TruncatedRow);
        }

        let mut rows = Vec::with_capacity(raw.len() / 8);

        for (i, chunk) in raw.chunks_exact(8).enumerate() {
            let hash = LE::read_u32(&chunk[..4]);
            let value = LE::read_u32(&chunk[4..]);
            let flat_type = FlatType::from_nibble(value >> 28)
                .map_err(|v| ReadError::UnknownType(i, v))?;

            if let Some(prev) = rows.last() {
                let prev: &Row = prev;

                if prev.hash > hash {
                    return Err(ReadError::NotSorted(i));
                }
            }

            rows.push(Row {
                hash,
                flat_type,
                index: value & INDEX_MASK,
            });
        }

        Ok(Self { rows })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rows.len() * 8);

        for row in &self.rows {
            out.extend(row.hash.to_le_bytes());
            out.extend(row.value().to_le_bytes());
        }

        out
    }

    /// Builds the table from a node list. Returns the table and, when any
    /// hashes collide, the collision-resolver blob.
    pub fn build(entries: &[PathEntry]) -> Result<(Self, Option<Vec<u8>>), BuildError> {
        // Group by hash, keeping the input order within a group.
        let mut groups: BTreeMap<u32, Vec<&PathEntry>> = BTreeMap::new();

        for entry in entries {
            let group = groups.entry(hash_path(&entry.path)).or_default();

            if group.iter().any(|e| e.path == entry.path) {
                return Err(BuildError::DuplicatePath(entry.path.clone()));
            }

            group.push(entry);
        }

        let mut rows = Vec::with_capacity(groups.len());
        let mut resolver = Vec::new();
        let mut any_collision = false;

        for (hash, group) in groups {
            if let [entry] = group.as_slice() {
                let ino: u32 = entry
                    .ino
                    .try_into()
                    .ok()
                    .filter(|v| v & !INDEX_MASK == 0)
                    .ok_or(BuildError::InodeOutOfRange(entry.ino))?;

                rows.push(Row {
                    hash,
                    flat_type: FlatType::tag(&entry.path, entry.is_dir),
                    index: ino,
                });

                continue;
            }

            // Colliding names go through the resolver blob.
            any_collision = true;

            let offset = resolver.len() as u32;

            if offset & !INDEX_MASK != 0 {
                return Err(BuildError::ResolverTooLarge);
            }

            for entry in group {
                write_resolver_record(&mut resolver, entry);
            }

            resolver.extend(vec![0u8; LIST_TRAILER]);
            rows.push(Row {
                hash,
                flat_type: FlatType::Collision,
                index: offset,
            });
        }

        Ok((Self { rows }, any_collision.then_some(resolver)))
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Rows ordered by (type, inode) for presentation.
    pub fn rows_by_type(&self) -> Vec<Row> {
        let mut rows = self.rows.clone();

        rows.sort_by_key(|r| (r.flat_type, r.index));

        rows
    }

    /// Looks up a path by hash only. Collisions come back as
    /// [`FlatType::Collision`] and need [`resolve()`][Self::resolve()].
    pub fn lookup(&self, path: &str) -> Option<Row> {
        let hash = hash_path(path);
        let i = self.rows.binary_search_by_key(&hash, |r| r.hash).ok()?;

        Some(self.rows[i])
    }

    /// Resolves a path to an inode number, scanning the collision resolver
    /// when needed.
    pub fn resolve(&self, path: &str, resolver: Option<&[u8]>) -> Result<Option<u64>, ResolveError> {
        let row = match self.lookup(path) {
            Some(v) => v,
            None => return Ok(None),
        };

        if row.flat_type != FlatType::Collision {
            return Ok(Some(row.index as u64));
        }

        let resolver = resolver.ok_or(ResolveError::NoResolver)?;
        let mut list = resolver
            .get(row.index as usize..)
            .ok_or(ResolveError::BadOffset(row.index))?;

        loop {
            let record = list.get(..16).ok_or(ResolveError::TruncatedRecord)?;
            let entsize = LE::read_u32(&record[0x0c..]) as usize;

            if entsize == 0 {
                return Ok(None);
            }

            let ino = LE::read_u32(&record[0x00..]);
            let namelen = LE::read_u32(&record[0x08..]) as usize;
            let name = list
                .get(16..(16 + namelen))
                .ok_or(ResolveError::TruncatedRecord)?;

            if name == path.as_bytes() {
                return Ok(Some(ino as u64));
            }

            list = list.get(entsize..).ok_or(ResolveError::TruncatedRecord)?;
        }
    }
}

/// A resolver record mirrors a dirent: inode, type, name length, record
/// size, then the full path as the name.
fn write_resolver_record(out: &mut Vec<u8>, entry: &PathEntry) {
    let name = entry.path.as_bytes();
    let entsize = (16 + name.len() + 3) & !3;
    let ty = if entry.is_dir { 3u32 } else { 2u32 };

    out.extend((entry.ino as u32).to_le_bytes());
    out.extend(ty.to_le_bytes());
    out.extend((name.len() as u32).to_le_bytes());
    out.extend((entsize as u32).to_le_bytes());
    out.extend_from_slice(name);
    out.extend(vec![0u8; entsize - 16 - name.len()]);
}

/// Errors for [`read()`][FlatPathTable::read()].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("table size is not a whole number of rows")]
    TruncatedRow,

    #[error("row #{0} has unknown type {1:#x}")]
    UnknownType(usize, u32),

    #[error("row #{0} is out of order")]
    NotSorted(usize),
}

/// Errors for [`build()`][FlatPathTable::build()].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate path {0}")]
    DuplicatePath(String),

    #[error("inode #{0} does not fit in a row")]
    InodeOutOfRange(u64),

    #[error("collision resolver exceeds the addressable size")]
    ResolverTooLarge,
}

/// Errors for [`resolve()`][FlatPathTable::resolve()].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("table has collisions but no resolver was supplied")]
    NoResolver,

    #[error("collision offset {0:#x} is not valid")]
    BadOffset(u32),

    #[error("collision record is truncated")]
    TruncatedRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, ino: u64, is_dir: bool) -> PathEntry {
        PathEntry {
            path: path.into(),
            ino,
            is_dir,
        }
    }

    #[test]
    fn hash_is_case_insensitive() {
        assert_eq!(hash_path("/a/B"), hash_path("/a/b"));
        assert_eq!(
            hash_path("/sce_sys/param.sfo"),
            hash_path("/SCE_SYS/PARAM.SFO")
        );
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_ne!(hash_path("/ab"), hash_path("/ba"));
    }

    #[test]
    fn rows_are_sorted_by_hash() {
        let entries = [
            entry("/zzz", 5, false),
            entry("/app.bin", 3, false),
            entry("/sce_sys", 2, true),
        ];

        let (table, resolver) = FlatPathTable::build(&entries).unwrap();

        assert!(resolver.is_none());
        assert!(table.rows().windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn type_tags_reflect_location_and_kind() {
        let entries = [
            entry("/sce_sys", 2, true),
            entry("/sce_sys/param.sfo", 3, false),
            entry("/data", 4, true),
            entry("/eboot.bin", 5, false),
        ];

        let (table, _) = FlatPathTable::build(&entries).unwrap();

        let ty = |p: &str| table.lookup(p).unwrap().flat_type;

        assert_eq!(ty("/sce_sys"), FlatType::SceSysDir);
        assert_eq!(ty("/sce_sys/param.sfo"), FlatType::SceSysFile);
        assert_eq!(ty("/data"), FlatType::Dir);
        assert_eq!(ty("/eboot.bin"), FlatType::File);
    }

    #[test]
    fn round_trip_without_collisions() {
        let entries = [
            entry("/sce_sys/param.sfo", 3, false),
            entry("/eboot.bin", 4, false),
            entry("/data", 5, true),
        ];

        let (table, resolver) = FlatPathTable::build(&entries).unwrap();

        assert!(resolver.is_none());

        let parsed = FlatPathTable::read(&table.to_bytes()).unwrap();

        assert_eq!(parsed.rows(), table.rows());
    }

    #[test]
    fn lookup_agrees_with_build_input() {
        let entries = [
            entry("/a", 10, false),
            entry("/b/c", 11, false),
            entry("/b", 12, true),
        ];

        let (table, _) = FlatPathTable::build(&entries).unwrap();

        for e in &entries {
            assert_eq!(table.resolve(&e.path, None).unwrap(), Some(e.ino));
        }

        assert_eq!(table.resolve("/missing", None).unwrap(), None);
    }

    #[test]
    fn collisions_resolve_through_the_blob() {
        // 'A'*31 + 'Z' == 'B'*31 + ';', so these two distinct paths share
        // one hash by construction.
        let a = "/AZ";
        let b = "/B;";

        assert_eq!(hash_path(a), hash_path(b));

        let entries = [entry(a, 7, false), entry(b, 8, false), entry("/data", 9, true)];
        let (table, resolver) = FlatPathTable::build(&entries).unwrap();
        let resolver = resolver.expect("collision must produce a resolver");

        let row = table.lookup(a).unwrap();

        assert_eq!(row.flat_type, FlatType::Collision);
        assert_eq!(table.resolve(a, Some(&resolver)).unwrap(), Some(7));
        assert_eq!(table.resolve(b, Some(&resolver)).unwrap(), Some(8));
        assert_eq!(table.resolve("/data", Some(&resolver)).unwrap(), Some(9));
    }

    #[test]
    fn collision_without_resolver_is_an_error() {
        let entries = [entry("/AZ", 7, false), entry("/B;", 8, false)];
        let (table, _) = FlatPathTable::build(&entries).unwrap();

        assert!(matches!(
            table.resolve("/AZ", None),
            Err(ResolveError::NoResolver)
        ));
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let entries = [entry("/same", 1, false), entry("/same", 2, false)];

        assert!(matches!(
            FlatPathTable::build(&entries),
            Err(BuildError::DuplicatePath(_))
        ));
    }

    #[test]
    fn unknown_row_type_is_rejected() {
        let mut raw = Vec::new();

        raw.extend(1u32.to_le_bytes());
        raw.extend(0x1000_0005u32.to_le_bytes());

        assert!(matches!(
            FlatPathTable::read(&raw),
            Err(ReadError::UnknownType(0, 0x1))
        ));
    }

    #[test]
    fn unsorted_rows_are_rejected() {
        let rows = [
            Row {
                hash: 9,
                flat_type: FlatType::File,
                index: 1,
            },
            Row {
                hash: 3,
                flat_type: FlatType::File,
                index: 2,
            },
        ];

        let raw = FlatPathTable { rows: rows.to_vec() }.to_bytes();

        assert!(matches!(
            FlatPathTable::read(&raw),
            Err(ReadError::NotSorted(1))
        ));
    }
}
