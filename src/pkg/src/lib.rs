use self::entry::{Entry, EntryNames};
use self::header::{ContentType, Header};
use self::keystore::KeyStore;
use memmap2::Mmap;
use pfs::image::Image;
use pfs::pfsc::Pfsc;
use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod entry;
pub mod header;
pub mod keystore;

mod export;
mod validate;

#[cfg(test)]
mod testpkg;

#[cfg(test)]
mod tests;

pub use export::{ExportError, ExportFailure, ExportReport};
pub use validate::{ValidationResult, ValidationStatus};

// https://www.psdevwiki.com/ps4/Package_Files
pub struct Pkg {
    raw: Mmap,
    header: Header,
    entries: Vec<Entry>,
    names: EntryNames,
    keys: PkgKeys,
    entry_key3_secret: Option<[u8; 32]>,
    /// None when the package carries no PFS image.
    pfs_encrypted: Option<bool>,
}

#[derive(Default)]
struct PkgKeys {
    passcode: Option<String>,
    ekpfs: Option<[u8; 32]>,
    xts: Option<([u8; 16], [u8; 16])>,
}

impl Pkg {
    /// Opens a PKG, validates the meta table and runs the key ladder
    /// against `store`. Newly recovered keys are cached in the store; the
    /// caller decides when to persist it.
    pub fn open<P: AsRef<Path>>(path: P, store: &mut KeyStore) -> Result<Self, OpenError> {
        // Open file and map it to memory.
        let file = File::open(path).map_err(OpenError::OpenFailed)?;
        let raw = unsafe { Mmap::map(&file) }.map_err(OpenError::MapFailed)?;
        let header = Header::read(&raw).map_err(OpenError::InvalidHeader)?;

        // Read the meta entry table.
        let table_len = header.entry_count() * Entry::RAW_SIZE;
        let table_offset: usize = header
            .table_offset()
            .try_into()
            .map_err(|_| OpenError::InvalidEntryTable)?;
        let table = raw
            .get(table_offset..(table_offset + table_len))
            .ok_or(OpenError::InvalidEntryTable)?;

        let entries: Vec<Entry> = table.chunks_exact(Entry::RAW_SIZE).map(Entry::read).collect();

        // Every entry must stay inside the package and entries must not
        // overlap.
        let mut ranges: Vec<(u64, u64, usize)> = Vec::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            let start = entry.data_offset();
            let end = start + entry.disk_size() as u64;

            if end > raw.len() as u64 {
                return Err(OpenError::InvalidEntryOffset(i));
            }

            ranges.push((start, end, i));
        }

        ranges.sort_unstable();

        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(OpenError::OverlappingEntries(pair[0].2, pair[1].2));
            }
        }

        // The name table is optional; entries fall back to the known id
        // mapping.
        let names = entries
            .iter()
            .position(|e| e.id() == Entry::ENTRY_NAMES)
            .map(|i| {
                let entry = &entries[i];
                let start = entry.data_offset() as usize;

                EntryNames::new(raw[start..(start + entry.data_size())].to_vec())
            })
            .unwrap_or_default();

        let mut pkg = Self {
            raw,
            header,
            entries,
            names,
            keys: PkgKeys::default(),
            entry_key3_secret: None,
            pfs_encrypted: None,
        };

        pkg.load_entry_key3();
        pkg.run_key_ladder(store)?;

        Ok(pkg)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The passcode the package was unlocked with, when one is known.
    pub fn passcode(&self) -> Option<&str> {
        self.keys.passcode.as_deref()
    }

    /// Resolved file name of an entry: the name table wins, then the known
    /// id mapping.
    pub fn entry_name(&self, index: usize) -> Option<&str> {
        let entry = self.entries.get(index)?;

        self.names
            .get(entry.filename_offset())
            .or_else(|| Entry::known_name(entry.id()))
    }

    pub fn find_entry(&self, id: u32) -> Option<(usize, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.id() == id)
    }

    /// Whether the embedded PFS can be read with the keys at hand.
    pub fn is_file_system_accessible(&self) -> bool {
        match self.pfs_encrypted {
            None => false,
            Some(false) => true,
            Some(true) => self.keys.ekpfs.is_some() || self.keys.xts.is_some(),
        }
    }

    /// Raw bytes of the embedded PFS image, if the package has one.
    pub fn pfs_image(&self) -> Option<&[u8]> {
        if self.header.pfs_image_size() == 0 {
            return None;
        }

        let start = self.header.pfs_image_offset() as usize;
        let end = start + self.header.pfs_image_size() as usize;

        self.raw.get(start..end)
    }

    /// Reads one meta entry, stripping the cipher padding when decrypting.
    pub fn extract_entry(&self, index: usize, decrypt: bool) -> Result<Vec<u8>, ExtractEntryError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(ExtractEntryError::InvalidIndex(index))?;
        let mut data = self.entry_data(entry).to_vec();

        if entry.is_encrypted() && decrypt {
            let (iv, key) = self.entry_cipher_params(index, entry)?;

            crypto::decrypt_cbc(&key, &iv, &mut data)
                .map_err(|_| ExtractEntryError::DecryptFailed(index))?;
            data.truncate(entry.data_size());
        }

        Ok(data)
    }

    /// Parses param.sfo from the meta table.
    pub fn param(&self) -> Result<sfo::Sfo, ParamError> {
        let (index, _) = self
            .find_entry(Entry::PARAM_SFO)
            .ok_or(ParamError::NotFound)?;
        let data = self.extract_entry(index, true).map_err(ParamError::ExtractFailed)?;

        sfo::Sfo::read(&data).map_err(ParamError::ParseFailed)
    }

    /// The entitlement key carried by additional-content packages.
    pub fn entitlement_key(&self) -> Result<[u8; 16], LicenseError> {
        let (index, _) = self
            .find_entry(Entry::LICENSE_DAT)
            .ok_or(LicenseError::NotFound)?;
        let data = self
            .extract_entry(index, true)
            .map_err(LicenseError::ExtractFailed)?;

        // The Secret blob sits at 0x100 and decrypts with the debug key;
        // the entitlement key is bytes [0x70, 0x80) of the plaintext.
        let mut secret = data
            .get(0x100..0x260)
            .ok_or(LicenseError::TooSmall)?
            .to_vec();

        crypto::decrypt_debug(&mut secret).map_err(|_| LicenseError::DecryptFailed)?;

        Ok(secret[0x70..0x80].try_into().unwrap())
    }

    /// Opens the outer PFS with whichever keys the ladder produced.
    pub fn outer_pfs(&self) -> Result<pfs::Pfs<'_>, PfsAccessError> {
        let image = self.pfs_image().ok_or(PfsAccessError::NoPfsImage)?;

        match self.pfs_encrypted {
            Some(false) => {}
            Some(true) if self.keys.xts.is_some() || self.keys.ekpfs.is_some() => {}
            _ => return Err(PfsAccessError::NoDecryptionKey),
        }

        let pfs = if let Some((data, tweak)) = &self.keys.xts {
            pfs::open_with_keys(image, data, tweak)
        } else {
            pfs::open(
                image,
                self.header.pfs_flags().into(),
                self.keys.ekpfs.as_ref().map(|v| v.as_slice()),
            )
        };

        pfs.map_err(PfsAccessError::OpenOuterFailed)
    }

    /// Opens the inner PFS: `uroot/pfs_image.dat` of the outer image,
    /// unwrapped through PFSC when it is compressed.
    pub fn inner_pfs(&self) -> Result<pfs::Pfs<'_>, PfsAccessError> {
        let outer = self.outer_pfs()?;
        let tree = outer.build_tree().map_err(PfsAccessError::WalkOuterFailed)?;
        let node = tree
            .child(tree.uroot(), "pfs_image.dat")
            .ok_or(PfsAccessError::NoInnerImage)?;
        let view = outer
            .file_view(tree.node(node).inode())
            .map_err(PfsAccessError::InnerViewFailed)?;

        let mut magic = [0u8; 4];

        view.read(0, &mut magic)
            .map_err(PfsAccessError::ReadInnerFailed)?;

        let image: Arc<dyn Image + '_> = Arc::new(view);
        let pfs = if &magic == b"PFSC" {
            let pfsc = Pfsc::open(image).map_err(PfsAccessError::OpenPfscFailed)?;

            pfs::open_image(Arc::new(pfsc))
        } else {
            pfs::open_image(image)
        };

        pfs.map_err(PfsAccessError::OpenInnerFailed)
    }

    /// Tries to unlock the PFS with a passcode; caches it on success.
    pub fn try_passcode(&mut self, passcode: &str, store: &mut KeyStore) -> bool {
        if !self.accept_passcode(passcode) {
            return false;
        }

        store.set_passcode(self.header.content_id(), passcode);

        true
    }

    /// Tries to unlock the PFS with an EKPFS; caches it on success.
    pub fn try_ekpfs(&mut self, ekpfs: &[u8; 32], store: &mut KeyStore) -> bool {
        if !self.accept_ekpfs(ekpfs) {
            return false;
        }

        store.set_ekpfs(self.header.content_id(), ekpfs);

        true
    }

    /// Tries explicit XTS keys; verified by a trial open of the outer PFS.
    pub fn try_xts(&mut self, data: &[u8; 16], tweak: &[u8; 16], store: &mut KeyStore) -> bool {
        if !self.accept_xts(data, tweak) {
            return false;
        }

        store.set_xts(&self.image_key_id(), data, tweak);

        true
    }

    fn entry_data(&self, entry: &Entry) -> &[u8] {
        // Ranges were validated at open.
        let start = entry.data_offset() as usize;

        &self.raw[start..(start + entry.disk_size())]
    }

    fn entry_cipher_params(
        &self,
        index: usize,
        entry: &Entry,
    ) -> Result<([u8; 16], [u8; 16]), ExtractEntryError> {
        let secret: [u8; 32] = match entry.key_index() {
            3 => self
                .entry_key3_secret
                .ok_or(ExtractEntryError::NoEntryKey(index))?,
            k if k < 3 => {
                let passcode = self
                    .keys
                    .passcode
                    .as_deref()
                    .ok_or(ExtractEntryError::NoEntryKey(index))?;

                crypto::passcode_entry_secret(self.header.content_id(), passcode)
                    .map_err(|_| ExtractEntryError::NoEntryKey(index))?
            }
            k => return Err(ExtractEntryError::UnsupportedKeyIndex(index, k)),
        };

        Ok(crypto::entry_key(&entry.to_bytes(), &secret))
    }

    /// The entry keys meta carries a seed, per-key digests and seven key
    /// blobs; debug packages expose key #3 through the debug cipher.
    fn load_entry_key3(&mut self) {
        let data = match self.find_entry(Entry::ENTRY_KEYS) {
            Some((_, entry)) => self.entry_data(entry),
            None => return,
        };

        let offset = 32 + 7 * 32 + 3 * 256;
        let mut key3 = match data.get(offset..(offset + 256)) {
            Some(v) => v.to_vec(),
            None => return,
        };

        if crypto::decrypt_debug(&mut key3).is_err() {
            return;
        }

        self.entry_key3_secret = Some(key3[..32].try_into().unwrap());
    }

    /// Key acquisition ladder: zero passcode, cached passcode, image key
    /// through the debug cipher, cached EKPFS, cached XTS keys. The first
    /// step that verifies wins.
    fn run_key_ladder(&mut self, store: &mut KeyStore) -> Result<(), OpenError> {
        let image = match self.pfs_image() {
            Some(v) => v,
            None => return Ok(()), // AC without extra data.
        };

        let sb = pfs::header::Header::read(image).map_err(OpenError::InvalidPfsImage)?;

        self.pfs_encrypted = Some(sb.mode().is_encrypted());

        if !sb.mode().is_encrypted() {
            return Ok(());
        }

        let content_id = self.header.content_id().to_owned();

        if self.accept_passcode(crypto::ZERO_PASSCODE) {
            store.set_passcode(&content_id, crypto::ZERO_PASSCODE);
            return Ok(());
        }

        if let Some(passcode) = store.passcode(&content_id).map(str::to_owned) {
            if self.accept_passcode(&passcode) {
                return Ok(());
            }
        }

        if let Some(ekpfs) = self.ekpfs_from_image_key() {
            if self.accept_ekpfs(&ekpfs) {
                store.set_ekpfs(&content_id, &ekpfs);
                return Ok(());
            }
        }

        if let Some(ekpfs) = store.ekpfs(&content_id) {
            if self.accept_ekpfs(&ekpfs) {
                return Ok(());
            }
        }

        for key in [content_id.clone(), self.image_key_id()] {
            if let Some((data, tweak)) = store.xts(&key) {
                if self.accept_xts(&data, &tweak) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn accept_passcode(&mut self, passcode: &str) -> bool {
        let ekpfs = match crypto::ekpfs_from_passcode(self.header.content_id(), passcode) {
            Ok(v) => v,
            Err(_) => return false,
        };

        if !self.accept_ekpfs(&ekpfs) {
            return false;
        }

        self.keys.passcode = Some(passcode.to_owned());

        true
    }

    fn accept_ekpfs(&mut self, ekpfs: &[u8; 32]) -> bool {
        let image = match self.pfs_image() {
            Some(v) => v,
            None => return false,
        };

        match pfs::check_ekpfs(image, ekpfs) {
            Ok(true) => {}
            _ => return false,
        }

        self.keys.ekpfs = Some(*ekpfs);

        true
    }

    fn accept_xts(&mut self, data: &[u8; 16], tweak: &[u8; 16]) -> bool {
        let image = match self.pfs_image() {
            Some(v) => v,
            None => return false,
        };

        // No MAC covers raw XTS keys; the check is a trial open plus a tree
        // walk, since inode records decode from any bytes.
        match pfs::open_with_keys(image, data, tweak) {
            Ok(pfs) if pfs.build_tree().is_ok() => {}
            _ => return false,
        }

        self.keys.xts = Some((*data, *tweak));

        true
    }

    /// EKPFS recovered from the image key entry of a debug package.
    fn ekpfs_from_image_key(&self) -> Option<[u8; 32]> {
        let (_, entry) = self.find_entry(Entry::IMAGE_KEY)?;
        let mut data = self.entry_data(entry).to_vec();

        if data.len() < 32 || data.len() % 16 != 0 {
            return None;
        }

        crypto::decrypt_debug(&mut data).ok()?;

        Some(data[..32].try_into().unwrap())
    }

    /// Store key for XTS keys bound to one image:
    /// `content_id-<first 8 hex digits of the image digest>`.
    fn image_key_id(&self) -> String {
        let mut id = String::with_capacity(self.header.content_id().len() + 9);

        id.push_str(self.header.content_id());
        id.push('-');

        for b in &self.header.pfs_image_digest()[..4] {
            write!(id, "{b:02x}").unwrap();
        }

        id
    }
}

/// Maps a content type to the project volume type.
pub fn volume_type(ty: ContentType) -> Option<gp4::VolumeType> {
    match ty {
        ContentType::Gd => Some(gp4::VolumeType::App),
        ContentType::Dp => Some(gp4::VolumeType::Patch),
        ContentType::Ac => Some(gp4::VolumeType::AcData),
        ContentType::Al => Some(gp4::VolumeType::AcNodata),
        ContentType::Unknown(_) => None,
    }
}

/// Errors for [`open()`][Pkg::open()].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot open file")]
    OpenFailed(#[source] std::io::Error),

    #[error("cannot map file")]
    MapFailed(#[source] std::io::Error),

    #[error("PKG header is not valid")]
    InvalidHeader(#[source] header::ReadError),

    #[error("entry table is not valid")]
    InvalidEntryTable,

    #[error("entry #{0} has invalid data offset")]
    InvalidEntryOffset(usize),

    #[error("entries #{0} and #{1} overlap")]
    OverlappingEntries(usize, usize),

    #[error("PFS image is not valid")]
    InvalidPfsImage(#[source] pfs::header::ReadError),
}

/// Errors for [`extract_entry()`][Pkg::extract_entry()].
#[derive(Debug, Error)]
pub enum ExtractEntryError {
    #[error("entry #{0} does not exist")]
    InvalidIndex(usize),

    #[error("no decryption key for entry #{0}")]
    NoEntryKey(usize),

    #[error("entry #{0} has unsupported key index {1}")]
    UnsupportedKeyIndex(usize, usize),

    #[error("cannot decrypt entry #{0}")]
    DecryptFailed(usize),
}

/// Errors for [`param()`][Pkg::param()].
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("the PKG does not have param.sfo")]
    NotFound,

    #[error("cannot extract param.sfo")]
    ExtractFailed(#[source] ExtractEntryError),

    #[error("the PKG has malformed param.sfo")]
    ParseFailed(#[source] sfo::ReadError),
}

/// Errors for [`entitlement_key()`][Pkg::entitlement_key()].
#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("the PKG does not have license.dat")]
    NotFound,

    #[error("cannot extract license.dat")]
    ExtractFailed(#[source] ExtractEntryError),

    #[error("license.dat is too small")]
    TooSmall,

    #[error("cannot decrypt the license secret")]
    DecryptFailed,
}

/// Errors for opening the embedded file systems.
#[derive(Debug, Error)]
pub enum PfsAccessError {
    #[error("the PKG has no PFS image")]
    NoPfsImage,

    #[error("no decryption key for the PFS image")]
    NoDecryptionKey,

    #[error("cannot open outer PFS")]
    OpenOuterFailed(#[source] pfs::OpenError),

    #[error("cannot walk outer PFS")]
    WalkOuterFailed(#[source] pfs::WalkError),

    #[error("outer PFS does not contain pfs_image.dat")]
    NoInnerImage,

    #[error("cannot open a view of pfs_image.dat")]
    InnerViewFailed(#[source] pfs::FileViewError),

    #[error("cannot read pfs_image.dat")]
    ReadInnerFailed(#[source] pfs::image::ReadError),

    #[error("cannot open the PFSC container")]
    OpenPfscFailed(#[source] pfs::pfsc::OpenError),

    #[error("cannot open inner PFS")]
    OpenInnerFailed(#[source] pfs::OpenError),
}
