//! Synthetic PKG fixtures for tests.

use self::aes_encrypt::encrypt_cbc;
use crate::entry::Entry;
use crate::header::ContentType;
use byteorder::{ByteOrder, BE};
use pfs::testimg::{self, Encryption, ImageSpec};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub const CONTENT_ID: &str = "AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ";
pub const ENTITLEMENT_KEY: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
];

pub const KEY_SEED: [u8; 16] = [0x21u8; 16];
const ENTRY_SECRET3: [u8; 32] = [0x44u8; 32];

/// Mirror of the CBC decryption in the crypto crate, used to produce
/// ciphertext the reader is expected to undo.
mod aes_encrypt {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncryptMut, KeyIvInit};
    use aes::Aes128;

    pub fn encrypt_cbc(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
        assert_eq!(data.len() % 16, 0);

        let mut encryptor = cbc::Encryptor::<Aes128>::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(iv),
        );

        for block in data.chunks_exact_mut(16) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

pub struct PkgOptions {
    pub content_type: ContentType,
    /// Passcode the image is sealed with.
    pub passcode: String,
    /// Include the IMAGE_KEY entry (EKPFS through the debug cipher).
    pub with_image_key: bool,
    pub with_license: bool,
    pub with_pfs: bool,
    pub inner_files: Vec<(String, Vec<u8>)>,
    pub time1_sec: u64,
}

impl Default for PkgOptions {
    fn default() -> Self {
        Self {
            content_type: ContentType::Gd,
            passcode: crypto::ZERO_PASSCODE.to_owned(),
            with_image_key: true,
            with_license: false,
            with_pfs: true,
            inner_files: vec![
                ("/eboot.bin".to_owned(), vec![0x7e; 0x2345]),
                ("/sce_module/libc.prx".to_owned(), b"prx bytes".to_vec()),
                ("/assets/level1.dat".to_owned(), vec![0x11; 600]),
            ],
            time1_sec: 1_700_000_000,
        }
    }
}

struct EntrySpec {
    id: u32,
    filename_offset: u32,
    plain: Vec<u8>,
    key_index: Option<usize>, // Some(_) means encrypted.
}

pub fn build(opts: &PkgOptions) -> Vec<u8> {
    let ekpfs = crypto::ekpfs_from_passcode(CONTENT_ID, &opts.passcode).unwrap();

    // Inner image -> PFSC -> encrypted outer image.
    let pfs_image = opts.with_pfs.then(|| {
        let inner = testimg::build(&ImageSpec {
            files: opts.inner_files.clone(),
            time1_sec: opts.time1_sec,
            encryption: None,
        });

        testimg::build(&ImageSpec {
            files: vec![("/pfs_image.dat".to_owned(), testimg::wrap_pfsc(&inner))],
            time1_sec: opts.time1_sec,
            encryption: Some(Encryption {
                ekpfs,
                seed: KEY_SEED,
            }),
        })
    });

    // Packaging tool metadata the exporter must strip.
    let mut param = sfo::Sfo::new();

    param.set("TITLE", sfo::Value::Utf8("Example Title".into()));
    param.set("TITLE_ID", sfo::Value::Utf8("ZZZZ99999".into()));
    param.set("VERSION", sfo::Value::Utf8("01.00".into()));
    param.set("ATTRIBUTE", sfo::Value::Integer(0));
    param.set(
        "PUBTOOLINFO",
        sfo::Value::Utf8("c_date=20240102,c_time=030405,sdk_ver=09500001".into()),
    );
    param.set("PUBTOOLVER", sfo::Value::Integer(0x09500001));

    // Name table: one entry resolves through it, the rest fall back to the
    // known id mapping.
    let names = b"\0icon0.png\0".to_vec();

    let mut entries = vec![
        EntrySpec {
            id: Entry::ENTRY_KEYS,
            filename_offset: 0,
            plain: entry_keys_blob(),
            key_index: None,
        },
        EntrySpec {
            id: Entry::ENTRY_NAMES,
            filename_offset: 0,
            plain: names,
            key_index: None,
        },
        EntrySpec {
            id: Entry::PARAM_SFO,
            filename_offset: 0,
            plain: param.to_bytes(),
            key_index: None,
        },
        EntrySpec {
            id: Entry::ICON0_PNG,
            filename_offset: 1,
            plain: b"fake png".to_vec(),
            key_index: None,
        },
        EntrySpec {
            id: Entry::NPTITLE_DAT,
            filename_offset: 0,
            plain: b"nptitle payload, not block aligned".to_vec(),
            key_index: Some(3),
        },
        EntrySpec {
            id: Entry::NPBIND_DAT,
            filename_offset: 0,
            plain: b"npbind payload".to_vec(),
            key_index: Some(0),
        },
        // Unknown id without a name; the exporter must skip it.
        EntrySpec {
            id: 0x0500,
            filename_offset: 0,
            plain: b"nameless".to_vec(),
            key_index: None,
        },
    ];

    if opts.with_image_key {
        let mut blob = vec![0u8; 256];

        blob[..32].copy_from_slice(&ekpfs);
        encrypt_cbc(&crypto::DEBUG_KEY, &[0u8; 16], &mut blob);
        entries.insert(
            1,
            EntrySpec {
                id: Entry::IMAGE_KEY,
                filename_offset: 0,
                plain: blob,
                key_index: None,
            },
        );
    }

    if opts.with_license {
        entries.push(EntrySpec {
            id: Entry::LICENSE_DAT,
            filename_offset: 0,
            plain: license_blob(),
            key_index: None,
        });
    }

    if let Some(image) = &pfs_image {
        let mut table = Vec::new();

        for chunk in image.chunks(0x10000) {
            table.extend_from_slice(&Sha1::digest(chunk)[..4]);
        }

        entries.push(EntrySpec {
            id: Entry::APP_PLAYGO_CHUNK_SHA,
            filename_offset: 0,
            plain: table,
            key_index: None,
        });
    }

    // The digest table gets patched once every other entry is final.
    let digests_index = entries.len();

    entries.push(EntrySpec {
        id: Entry::DIGESTS,
        filename_offset: 0,
        plain: vec![0u8; (entries.len() + 1) * 32],
        key_index: None,
    });

    // Lay out the body: entry table at 0x1000, data right after.
    let table_offset = 0x1000usize;
    let table_len = entries.len() * Entry::RAW_SIZE;
    let mut offsets = Vec::with_capacity(entries.len());
    let mut cursor = align(table_offset + table_len, 16);

    for spec in &entries {
        offsets.push(cursor);
        cursor += align(disk_len(spec), 16);
    }

    let body_end = cursor;
    let pfs_offset = align(body_end, 0x1000);
    let pfs_len = pfs_image.as_ref().map(Vec::len).unwrap_or(0);
    let package_size = pfs_offset + pfs_len;

    // Entry records.
    let mut table = vec![0u8; table_len];

    for (i, spec) in entries.iter().enumerate() {
        let record = &mut table[(i * Entry::RAW_SIZE)..((i + 1) * Entry::RAW_SIZE)];
        let flags1 = if spec.key_index.is_some() {
            0x80000000u32
        } else {
            0
        };
        let flags2 = (spec.key_index.unwrap_or(0) as u32) << 12;

        BE::write_u32(&mut record[0..], spec.id);
        BE::write_u32(&mut record[4..], spec.filename_offset);
        BE::write_u32(&mut record[8..], flags1);
        BE::write_u32(&mut record[12..], flags2);
        BE::write_u32(&mut record[16..], offsets[i] as u32);
        BE::write_u32(&mut record[20..], spec.plain.len() as u32);
    }

    // Digest table covers plaintext, including entries stored encrypted.
    {
        let mut digests = vec![0u8; entries.len() * 32];

        for (i, spec) in entries.iter().enumerate() {
            if i == digests_index {
                continue;
            }

            digests[(i * 32)..(i * 32 + 32)].copy_from_slice(&Sha256::digest(&spec.plain));
        }

        // Self-referencing slot must be zero before hashing, so the table
        // digest cannot cover itself either.
        entries[digests_index].plain = digests;
    }

    // Assemble the file.
    let mut out = vec![0u8; package_size];

    out[table_offset..(table_offset + table_len)].copy_from_slice(&table);

    for (i, spec) in entries.iter().enumerate() {
        let mut data = spec.plain.clone();

        if let Some(kidx) = spec.key_index {
            data.resize(align(data.len(), 16), 0);

            let secret: [u8; 32] = match kidx {
                3 => ENTRY_SECRET3,
                _ => crypto::passcode_entry_secret(CONTENT_ID, &opts.passcode).unwrap(),
            };
            let record: [u8; 32] = table[(i * Entry::RAW_SIZE)..((i + 1) * Entry::RAW_SIZE)]
                .try_into()
                .unwrap();
            let (iv, key) = seal_entry_key(&record, &secret);

            encrypt_cbc(&key, &iv, &mut data);
        }

        out[offsets[i]..(offsets[i] + data.len())].copy_from_slice(&data);
    }

    if let Some(image) = &pfs_image {
        out[pfs_offset..].copy_from_slice(image);
    }

    // Header.
    BE::write_u32(&mut out[0x00..], 0x7f434e54);
    BE::write_u32(&mut out[0x10..], entries.len() as u32);
    BE::write_u32(&mut out[0x18..], table_offset as u32);
    BE::write_u64(&mut out[0x20..], table_offset as u64);
    BE::write_u64(&mut out[0x28..], (body_end - table_offset) as u64);
    out[0x40..(0x40 + CONTENT_ID.len())].copy_from_slice(CONTENT_ID.as_bytes());
    BE::write_u32(&mut out[0x74..], opts.content_type.into());
    BE::write_u64(&mut out[0x410..], pfs_offset as u64);
    BE::write_u64(&mut out[0x418..], pfs_len as u64);
    BE::write_u64(&mut out[0x430..], package_size as u64);

    let entries_digest = Sha256::digest(&out[table_offset..(table_offset + table_len)]);
    let body_digest = Sha256::digest(&out[table_offset..body_end]);

    out[0x100..0x120].copy_from_slice(&entries_digest);
    out[0x120..0x140].copy_from_slice(&body_digest);

    if pfs_len != 0 {
        let image_digest = Sha256::digest(&out[pfs_offset..]);

        out[0x440..0x460].copy_from_slice(&image_digest);
    }

    out
}

/// The packager's per-entry key expansion, written out independently of
/// the crypto crate: `(iv, key)` is the split of
/// `SHA-256(entry record || secret)`. Fixtures sealed here keep the
/// round-trip tests honest about the real formula.
fn seal_entry_key(record: &[u8; 32], secret: &[u8; 32]) -> ([u8; 16], [u8; 16]) {
    let mut sha256 = Sha256::new();

    sha256.update(record);
    sha256.update(secret);

    let digest = sha256.finalize();

    (
        digest[..16].try_into().unwrap(),
        digest[16..].try_into().unwrap(),
    )
}

/// Seed, seven digests, seven 256-byte key blobs; key #3 carries the entry
/// secret under the debug cipher.
fn entry_keys_blob() -> Vec<u8> {
    let mut blob = vec![0u8; 32 + 7 * 32 + 7 * 256];
    let offset = 32 + 7 * 32 + 3 * 256;
    let mut key3 = vec![0u8; 256];

    key3[..32].copy_from_slice(&ENTRY_SECRET3);
    encrypt_cbc(&crypto::DEBUG_KEY, &[0u8; 16], &mut key3);
    blob[offset..(offset + 256)].copy_from_slice(&key3);

    blob
}

/// license.dat with the entitlement key sealed inside the Secret blob.
fn license_blob() -> Vec<u8> {
    let mut out = vec![0u8; 0x400];
    let mut secret = vec![0u8; 0x160];

    secret[0x70..0x80].copy_from_slice(&ENTITLEMENT_KEY);
    encrypt_cbc(&crypto::DEBUG_KEY, &[0u8; 16], &mut secret);
    out[0x100..0x260].copy_from_slice(&secret);

    out
}

fn disk_len(spec: &EntrySpec) -> usize {
    if spec.key_index.is_some() {
        align(spec.plain.len(), 16)
    } else {
        spec.plain.len()
    }
}

fn align(v: usize, to: usize) -> usize {
    (v + to - 1) & !(to - 1)
}
