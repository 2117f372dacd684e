use crate::entry::Entry;
use crate::Pkg;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Outcome of one validation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Ok,
    Fail,
    /// The digest needs a key that is not available. Not fatal.
    NoKey,
}

/// One validated region of the package.
#[derive(Debug)]
pub struct ValidationResult {
    pub name: String,
    pub description: String,
    /// Absolute file offset of the validated range.
    pub location: u64,
    pub status: ValidationStatus,
}

impl Pkg {
    /// Runs every digest check the package carries and returns the results
    /// ordered by location so callers can stream them.
    ///
    /// Validation never fails as a whole; individual rows carry their
    /// status.
    pub fn validate(&self) -> Vec<ValidationResult> {
        let mut results = Vec::new();

        self.validate_header_digests(&mut results);
        self.validate_entry_digests(&mut results);
        self.validate_pfs_image(&mut results);
        self.validate_playgo_chunks(&mut results);

        results.sort_by(|a, b| a.location.cmp(&b.location).then(a.name.cmp(&b.name)));

        results
    }

    fn validate_header_digests(&self, results: &mut Vec<ValidationResult>) {
        // Entry table digest.
        let table_offset = self.header.table_offset();
        let table_len = self.header.entry_count() * Entry::RAW_SIZE;
        let status = match self.file_range(table_offset, table_len as u64) {
            Some(v) => ok_or_fail(&sha256(v) == self.header.entries_digest()),
            None => ValidationStatus::Fail,
        };

        results.push(ValidationResult {
            name: "entry table digest".into(),
            description: "SHA-256 of the meta entry table".into(),
            location: table_offset,
            status,
        });

        // Body digest.
        let status = match self.file_range(self.header.body_offset(), self.header.body_size()) {
            Some(v) => ok_or_fail(&sha256(v) == self.header.body_digest()),
            None => ValidationStatus::Fail,
        };

        results.push(ValidationResult {
            name: "body digest".into(),
            description: "SHA-256 of the package body".into(),
            location: self.header.body_offset(),
            status,
        });
    }

    /// Compares every entry against the digest table, decrypting entries
    /// first: the recorded digests cover plaintext.
    fn validate_entry_digests(&self, results: &mut Vec<ValidationResult>) {
        let (digests_index, digests) = match self.find_entry(Entry::DIGESTS) {
            Some((i, e)) => (i, self.entry_data(e).to_vec()),
            None => return,
        };

        for (i, entry) in self.entries.iter().enumerate() {
            // The digest table cannot cover itself.
            if i == digests_index {
                continue;
            }

            let expected = match digests.get((i * 32)..(i * 32 + 32)) {
                Some(v) => v,
                None => break,
            };

            let name = self
                .entry_name(i)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("entry #{i}"));

            let status = match self.extract_entry(i, true) {
                Ok(data) => ok_or_fail(sha256(&data).as_slice() == expected),
                Err(crate::ExtractEntryError::NoEntryKey(_)) => ValidationStatus::NoKey,
                Err(_) => ValidationStatus::Fail,
            };

            results.push(ValidationResult {
                name: format!("entry digest: {name}"),
                description: "SHA-256 of the entry data".into(),
                location: entry.data_offset(),
                status,
            });
        }
    }

    fn validate_pfs_image(&self, results: &mut Vec<ValidationResult>) {
        let image = match self.pfs_image() {
            Some(v) => v,
            None => return,
        };

        results.push(ValidationResult {
            name: "pfs image digest".into(),
            description: "SHA-256 of the embedded PFS image".into(),
            location: self.header.pfs_image_offset(),
            status: ok_or_fail(&sha256(image) == self.header.pfs_image_digest()),
        });
    }

    /// The PlayGo chunk table holds the first four bytes of the SHA-1 of
    /// every 64 KiB chunk of the PFS image.
    fn validate_playgo_chunks(&self, results: &mut Vec<ValidationResult>) {
        let (index, entry) = match self.find_entry(Entry::APP_PLAYGO_CHUNK_SHA) {
            Some(v) => v,
            None => return,
        };

        let image = match self.pfs_image() {
            Some(v) => v,
            None => return,
        };

        let status = match self.extract_entry(index, true) {
            Ok(table) => {
                let mut ok = true;
                let mut chunks = image.chunks(0x10000);

                for expected in table.chunks_exact(4) {
                    match chunks.next() {
                        Some(chunk) => {
                            let digest = Sha1::digest(chunk);

                            if &digest[..4] != expected {
                                ok = false;
                                break;
                            }
                        }
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }

                ok_or_fail(ok && chunks.next().is_none())
            }
            Err(crate::ExtractEntryError::NoEntryKey(_)) => ValidationStatus::NoKey,
            Err(_) => ValidationStatus::Fail,
        };

        results.push(ValidationResult {
            name: "playgo chunk digests".into(),
            description: "SHA-1 of each 64 KiB chunk of the PFS image".into(),
            location: entry.data_offset(),
            status,
        });
    }

    fn file_range(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let start: usize = offset.try_into().ok()?;
        let len: usize = len.try_into().ok()?;

        self.raw.get(start..(start.checked_add(len)?))
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn ok_or_fail(ok: bool) -> ValidationStatus {
    if ok {
        ValidationStatus::Ok
    } else {
        ValidationStatus::Fail
    }
}
