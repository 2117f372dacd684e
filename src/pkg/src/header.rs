use thiserror::Error;
use util::view::View;

/// Minimum size of the header region.
pub const HEADER_SIZE: usize = 0x1000;

const MAGIC: u32 = 0x7f434e54;

/// Contains PKG header.
///
/// See https://www.psdevwiki.com/ps4/Package_Files for some basic
/// information. All integers are big-endian.
pub struct Header {
    flags: u32,
    entry_count: u32,
    table_offset: u64,
    body_offset: u64,
    body_size: u64,
    content_id: String,
    content_type: ContentType,
    content_flags: u32,
    entries_digest: [u8; 32],
    body_digest: [u8; 32],
    pfs_flags: u64,
    pfs_image_offset: u64,
    pfs_image_size: u64,
    package_size: u64,
    pfs_image_digest: [u8; 32],
}

impl Header {
    pub fn read(pkg: &[u8]) -> Result<Self, ReadError> {
        // Check size first so the remaining reads cannot fail.
        if pkg.len() < HEADER_SIZE {
            return Err(ReadError::TooSmall);
        }

        let raw = View::new(&pkg[..HEADER_SIZE]);

        if raw.u32_be(0x00).unwrap() != MAGIC {
            return Err(ReadError::InvalidMagic);
        }

        // The content id is 36 ASCII characters, NUL padded to 48 bytes.
        let content_id = raw.bytes(0x40, 36).unwrap();
        let content_id = std::str::from_utf8(content_id)
            .ok()
            .filter(|v| v.is_ascii())
            .ok_or(ReadError::InvalidContentId)?
            .to_owned();

        Ok(Self {
            flags: raw.u32_be(0x04).unwrap(),
            entry_count: raw.u32_be(0x10).unwrap(),
            table_offset: raw.u32_be(0x18).unwrap() as u64,
            body_offset: raw.u64_be(0x20).unwrap(),
            body_size: raw.u64_be(0x28).unwrap(),
            content_id,
            content_type: ContentType::from(raw.u32_be(0x74).unwrap()),
            content_flags: raw.u32_be(0x78).unwrap(),
            entries_digest: raw.array(0x100).unwrap(),
            body_digest: raw.array(0x120).unwrap(),
            pfs_flags: raw.u64_be(0x408).unwrap(),
            pfs_image_offset: raw.u64_be(0x410).unwrap(),
            pfs_image_size: raw.u64_be(0x418).unwrap(),
            package_size: raw.u64_be(0x430).unwrap(),
            pfs_image_digest: raw.array(0x440).unwrap(),
        })
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count as _
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn body_offset(&self) -> u64 {
        self.body_offset
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn content_flags(&self) -> u32 {
        self.content_flags
    }

    pub fn entries_digest(&self) -> &[u8; 32] {
        &self.entries_digest
    }

    pub fn body_digest(&self) -> &[u8; 32] {
        &self.body_digest
    }

    pub fn pfs_flags(&self) -> u64 {
        self.pfs_flags
    }

    pub fn pfs_image_offset(&self) -> u64 {
        self.pfs_image_offset
    }

    pub fn pfs_image_size(&self) -> u64 {
        self.pfs_image_size
    }

    pub fn package_size(&self) -> u64 {
        self.package_size
    }

    pub fn pfs_image_digest(&self) -> &[u8; 32] {
        &self.pfs_image_digest
    }
}

/// Package content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// A full game or application.
    Gd,
    /// A patch.
    Dp,
    /// Additional content with extra data.
    Ac,
    /// Additional content without extra data.
    Al,
    Unknown(u32),
}

impl From<u32> for ContentType {
    fn from(v: u32) -> Self {
        match v {
            0x1a => Self::Gd,
            0x1b => Self::Ac,
            0x1c => Self::Al,
            0x1e => Self::Dp,
            v => Self::Unknown(v),
        }
    }
}

impl From<ContentType> for u32 {
    fn from(v: ContentType) -> Self {
        match v {
            ContentType::Gd => 0x1a,
            ContentType::Ac => 0x1b,
            ContentType::Al => 0x1c,
            ContentType::Dp => 0x1e,
            ContentType::Unknown(v) => v,
        }
    }
}

/// Errors for [`read()`][Header::read()].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too small")]
    TooSmall,

    #[error("invalid magic")]
    InvalidMagic,

    #[error("content id is not valid")]
    InvalidContentId,
}
