use util::view::View;

/// One row of the meta entry table, describing a tagged blob in the PKG
/// body.
pub struct Entry {
    id: u32,
    filename_offset: u32,
    flags1: u32,
    flags2: u32,
    data_offset: u32,
    data_size: u32,
}

impl Entry {
    pub const RAW_SIZE: usize = 32;

    pub const ENTRY_KEYS: u32 = 0x00000010;
    pub const IMAGE_KEY: u32 = 0x00000020;
    pub const GENERAL_DIGESTS: u32 = 0x00000080;
    pub const METAS: u32 = 0x00000100;
    pub const DIGESTS: u32 = 0x00000180;
    pub const ENTRY_NAMES: u32 = 0x00000200;
    pub const LICENSE_DAT: u32 = 0x00000400;
    pub const LICENSE_INFO: u32 = 0x00000401;
    pub const NPTITLE_DAT: u32 = 0x00000402;
    pub const NPBIND_DAT: u32 = 0x00000403;
    pub const SELFINFO_DAT: u32 = 0x00000404;
    pub const IMAGEINFO_DAT: u32 = 0x00000406;
    pub const TARGET_DELTAINFO_DAT: u32 = 0x00000407;
    pub const ORIGIN_DELTAINFO_DAT: u32 = 0x00000408;
    pub const PSRESERVED_DAT: u32 = 0x00000409;
    pub const PARAM_SFO: u32 = 0x00001000;
    pub const PRONUNCIATION_XML: u32 = 0x00001004;
    pub const PRONUNCIATION_SIG: u32 = 0x00001005;
    pub const PIC1_PNG: u32 = 0x00001006;
    pub const PUBTOOLINFO_DAT: u32 = 0x00001007;
    pub const APP_PLAYGO_CHUNK_DAT: u32 = 0x00001008;
    pub const APP_PLAYGO_CHUNK_SHA: u32 = 0x00001009;
    pub const APP_PLAYGO_MANIFEST_XML: u32 = 0x0000100a;
    pub const SHAREPARAM_JSON: u32 = 0x0000100b;
    pub const SHAREOVERLAYIMAGE_PNG: u32 = 0x0000100c;
    pub const SAVE_DATA_PNG: u32 = 0x0000100d;
    pub const SHAREPRIVACYGUARDIMAGE_PNG: u32 = 0x0000100e;
    pub const ICON0_PNG: u32 = 0x00001200;
    pub const PIC0_PNG: u32 = 0x00001220;
    pub const SND0_AT9: u32 = 0x00001240;
    pub const CHANGEINFO_CHANGEINFO_XML: u32 = 0x00001260;
    pub const ICON0_DDS: u32 = 0x00001280;
    pub const PIC0_DDS: u32 = 0x000012a0;
    pub const PIC1_DDS: u32 = 0x000012c0;

    /// `raw` must be at least [`RAW_SIZE`][Self::RAW_SIZE] bytes.
    pub fn read(raw: &[u8]) -> Self {
        let raw = View::new(&raw[..Self::RAW_SIZE]);

        Self {
            id: raw.u32_be(0).unwrap(),
            filename_offset: raw.u32_be(4).unwrap(),
            flags1: raw.u32_be(8).unwrap(),
            flags2: raw.u32_be(12).unwrap(),
            data_offset: raw.u32_be(16).unwrap(),
            data_size: raw.u32_be(20).unwrap(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn filename_offset(&self) -> u32 {
        self.filename_offset
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags1 & 0x80000000 != 0
    }

    pub fn key_index(&self) -> usize {
        ((self.flags2 & 0xf000) >> 12) as _
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset as _
    }

    pub fn data_size(&self) -> usize {
        self.data_size as _
    }

    /// Size occupied on disk; encrypted entries are padded to whole cipher
    /// blocks.
    pub fn disk_size(&self) -> usize {
        if self.is_encrypted() {
            (self.data_size as usize + 15) & !15
        } else {
            self.data_size as usize
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];

        buf[0..4].copy_from_slice(&self.id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.filename_offset.to_be_bytes());
        buf[8..12].copy_from_slice(&self.flags1.to_be_bytes());
        buf[12..16].copy_from_slice(&self.flags2.to_be_bytes());
        buf[16..20].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&self.data_size.to_be_bytes());

        buf
    }

    /// File name for entries with a fixed id → name mapping, as a path
    /// relative to `sce_sys`.
    pub fn known_name(id: u32) -> Option<&'static str> {
        let name = match id {
            Self::NPTITLE_DAT => "nptitle.dat",
            Self::NPBIND_DAT => "npbind.dat",
            Self::SELFINFO_DAT => "selfinfo.dat",
            Self::IMAGEINFO_DAT => "imageinfo.dat",
            Self::TARGET_DELTAINFO_DAT => "target-deltainfo.dat",
            Self::ORIGIN_DELTAINFO_DAT => "origin-deltainfo.dat",
            Self::PARAM_SFO => "param.sfo",
            Self::PRONUNCIATION_XML => "pronunciation.xml",
            Self::PRONUNCIATION_SIG => "pronunciation.sig",
            Self::PIC1_PNG => "pic1.png",
            Self::PUBTOOLINFO_DAT => "pubtoolinfo.dat",
            Self::APP_PLAYGO_CHUNK_DAT => "app/playgo-chunk.dat",
            Self::APP_PLAYGO_CHUNK_SHA => "app/playgo-chunk.sha",
            Self::APP_PLAYGO_MANIFEST_XML => "app/playgo-manifest.xml",
            Self::SHAREPARAM_JSON => "shareparam.json",
            Self::SHAREOVERLAYIMAGE_PNG => "shareoverlayimage.png",
            Self::SAVE_DATA_PNG => "save_data.png",
            Self::SHAREPRIVACYGUARDIMAGE_PNG => "shareprivacyguardimage.png",
            Self::ICON0_PNG => "icon0.png",
            Self::PIC0_PNG => "pic0.png",
            Self::SND0_AT9 => "snd0.at9",
            Self::CHANGEINFO_CHANGEINFO_XML => "changeinfo/changeinfo.xml",
            Self::ICON0_DDS => "icon0.dds",
            Self::PIC0_DDS => "pic0.dds",
            Self::PIC1_DDS => "pic1.dds",
            Self::LICENSE_DAT => "license.dat",
            Self::LICENSE_INFO => "license.info",
            Self::PSRESERVED_DAT => "psreserved.dat",
            _ => return None,
        };

        Some(name)
    }
}

/// The packed NUL-terminated name blob from the `ENTRY_NAMES` meta.
#[derive(Default)]
pub struct EntryNames {
    raw: Vec<u8>,
}

impl EntryNames {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// Name at `offset`, as addressed by an entry's filename offset. Offset
    /// zero means the entry has no name.
    pub fn get(&self, offset: u32) -> Option<&str> {
        if offset == 0 {
            return None;
        }

        let tail = self.raw.get(offset as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;

        std::str::from_utf8(&tail[..end]).ok()
    }
}
