use byteorder::{ByteOrder, WriteBytesExt, BE, LE};
use thiserror::Error;

#[cfg(test)]
mod tests;

const PSF_MAGIC: u32 = 0x00505346;
const SCEC_MAGIC: u32 = 0x53434543;
const SCEC_SKIP: usize = 0x800;
const HEADER_SIZE: usize = 0x14;
const INDEX_ENTRY_SIZE: usize = 0x10;

const FMT_UTF8_SPECIAL: u16 = 0x0004;
const FMT_UTF8: u16 = 0x0204;
const FMT_INTEGER: u16 = 0x0404;

/// One parameter value.
///
/// See https://www.psdevwiki.com/ps4/Param.sfo#Internal_Structure for the
/// on-disk formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Format 0x0004: UTF-8 text without a NUL terminator.
    Utf8Special(String),
    /// Format 0x0204: NUL-terminated UTF-8 text.
    Utf8(String),
    /// Format 0x0404: 32-bit little-endian integer.
    Integer(u32),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8Special(v) | Self::Utf8(v) => Some(v),
            Self::Integer(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<u32> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    fn format(&self) -> u16 {
        match self {
            Self::Utf8Special(_) => FMT_UTF8_SPECIAL,
            Self::Utf8(_) => FMT_UTF8,
            Self::Integer(_) => FMT_INTEGER,
        }
    }

    /// Stored length, including the NUL terminator for [`Value::Utf8`].
    fn stored_len(&self) -> usize {
        match self {
            Self::Utf8Special(v) => v.len(),
            Self::Utf8(v) => v.len() + 1,
            Self::Integer(_) => 4,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: Value,
    max_len: u32,
}

/// A loaded param.sfo.
pub struct Sfo {
    version: u32,
    entries: Vec<Entry>,
}

impl Sfo {
    pub fn new() -> Self {
        Self {
            version: 0x101,
            entries: Vec::new(),
        }
    }

    /// Parses a param.sfo image. Files wrapped in an `SCEC` container skip
    /// the 0x800-byte prefix first.
    pub fn read(raw: &[u8]) -> Result<Self, ReadError> {
        // Check for SCEC container.
        let raw = if raw.len() >= 4 && BE::read_u32(raw) == SCEC_MAGIC {
            raw.get(SCEC_SKIP..).ok_or(ReadError::TooSmall)?
        } else {
            raw
        };

        if raw.len() < HEADER_SIZE {
            return Err(ReadError::TooSmall);
        }

        // Check magic.
        if BE::read_u32(raw) != PSF_MAGIC {
            return Err(ReadError::InvalidMagic);
        }

        // Load the header.
        let version = LE::read_u32(&raw[0x04..]);
        let key_table = LE::read_u32(&raw[0x08..]) as usize;
        let data_table = LE::read_u32(&raw[0x0C..]) as usize;
        let count = LE::read_u32(&raw[0x10..]) as usize;

        if data_table < key_table {
            return Err(ReadError::InvalidTableLayout);
        }

        // Read entries.
        let mut entries = Vec::with_capacity(count);

        for i in 0..count {
            let offset = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let index = raw
                .get(offset..(offset + INDEX_ENTRY_SIZE))
                .ok_or(ReadError::TooSmall)?;

            let key_offset = key_table + LE::read_u16(&index[0x00..]) as usize;
            let format = LE::read_u16(&index[0x02..]);
            let len = LE::read_u32(&index[0x04..]) as usize;
            let max_len = LE::read_u32(&index[0x08..]);
            let data_offset = data_table + LE::read_u32(&index[0x0C..]) as usize;

            // Get key name.
            let key = match raw.get(key_offset..) {
                Some(v) => match v.iter().position(|&b| b == 0) {
                    Some(end) => std::str::from_utf8(&v[..end])
                        .map_err(|_| ReadError::InvalidKey(i))?
                        .to_owned(),
                    None => return Err(ReadError::InvalidKey(i)),
                },
                None => return Err(ReadError::InvalidKey(i)),
            };

            // Get value.
            let data = raw
                .get(data_offset..(data_offset + len))
                .ok_or(ReadError::InvalidValueOffset(i))?;

            let value = match format {
                FMT_UTF8_SPECIAL => Value::Utf8Special(
                    std::str::from_utf8(data)
                        .map_err(|_| ReadError::InvalidValue(i))?
                        .to_owned(),
                ),
                FMT_UTF8 => {
                    // Length includes the NUL terminator.
                    let (text, nul) = data.split_at(len.checked_sub(1).ok_or(ReadError::InvalidValue(i))?);

                    if nul[0] != 0 {
                        return Err(ReadError::InvalidValue(i));
                    }

                    Value::Utf8(
                        std::str::from_utf8(text)
                            .map_err(|_| ReadError::InvalidValue(i))?
                            .to_owned(),
                    )
                }
                FMT_INTEGER => {
                    if len != 4 {
                        return Err(ReadError::InvalidValue(i));
                    }

                    Value::Integer(LE::read_u32(data))
                }
                v => return Err(ReadError::UnknownFormat(i, v)),
            };

            entries.push(Entry {
                key,
                value,
                max_len,
            });
        }

        Ok(Self { version, entries })
    }

    /// Serializes to the canonical layout: values sorted ascending by key,
    /// key table first, data table 4-byte aligned.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();

        entries.sort_by(|a, b| a.key.cmp(&b.key));

        // Lay out the key table.
        let mut key_offsets = Vec::with_capacity(entries.len());
        let mut key_blob = Vec::new();

        for entry in &entries {
            key_offsets.push(key_blob.len() as u16);
            key_blob.extend_from_slice(entry.key.as_bytes());
            key_blob.push(0);
        }

        let key_table = HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
        let data_table = align4(key_table + key_blob.len());

        // Lay out the data table.
        let mut data_offsets = Vec::with_capacity(entries.len());
        let mut data_blob = Vec::new();

        for entry in &entries {
            let reserved = reserved_len(entry);

            data_offsets.push(data_blob.len() as u32);

            match &entry.value {
                Value::Utf8Special(v) => data_blob.extend_from_slice(v.as_bytes()),
                Value::Utf8(v) => {
                    data_blob.extend_from_slice(v.as_bytes());
                    data_blob.push(0);
                }
                Value::Integer(v) => data_blob.extend_from_slice(&v.to_le_bytes()),
            }

            data_blob.resize(data_offsets.last().copied().unwrap() as usize + reserved, 0);
        }

        // Write out.
        let mut out = Vec::with_capacity(data_table + data_blob.len());

        out.write_u32::<BE>(PSF_MAGIC).unwrap();
        out.write_u32::<LE>(self.version).unwrap();
        out.write_u32::<LE>(key_table as u32).unwrap();
        out.write_u32::<LE>(data_table as u32).unwrap();
        out.write_u32::<LE>(entries.len() as u32).unwrap();

        for (i, entry) in entries.iter().enumerate() {
            out.write_u16::<LE>(key_offsets[i]).unwrap();
            out.write_u16::<LE>(entry.value.format()).unwrap();
            out.write_u32::<LE>(entry.value.stored_len() as u32).unwrap();
            out.write_u32::<LE>(reserved_len(entry) as u32).unwrap();
            out.write_u32::<LE>(data_offsets[i]).unwrap();
        }

        out.extend_from_slice(&key_blob);
        out.resize(data_table, 0);
        out.extend_from_slice(&data_blob);

        out
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Inserts or replaces a value. A replaced value keeps its reservation
    /// if the new value still fits.
    pub fn set(&mut self, key: &str, value: Value) {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(Entry {
                key: key.to_owned(),
                value,
                max_len: 0,
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let i = self.entries.iter().position(|e| e.key == key)?;

        Some(self.entries.remove(i).value)
    }

    /// Keys in entry order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Sfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a `key=value,key=value` parameter string the way PUBTOOLINFO is
/// packed. Segments without `=` are skipped.
pub fn split_pairs(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value.split(',').filter_map(|pair| pair.split_once('='))
}

fn reserved_len(entry: &Entry) -> usize {
    align4(entry.value.stored_len()).max(entry.max_len as usize)
}

fn align4(v: usize) -> usize {
    (v + 3) & !3
}

/// Errors for reading param.sfo.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too small")]
    TooSmall,

    #[error("invalid magic")]
    InvalidMagic,

    #[error("data table begins before key table")]
    InvalidTableLayout,

    #[error("entry #{0} has invalid key offset")]
    InvalidKey(usize),

    #[error("entry #{0} has invalid value offset")]
    InvalidValueOffset(usize),

    #[error("entry #{0} has invalid value")]
    InvalidValue(usize),

    #[error("entry #{0} has unknown value format {1:#06x}")]
    UnknownFormat(usize, u16),
}
