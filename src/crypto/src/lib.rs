use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use xts_mode::Xts128;

/// Length of a package passcode, in ASCII characters.
pub const PASSCODE_LEN: usize = 32;

/// The passcode every debug-mode package is sealed with.
pub const ZERO_PASSCODE: &str = "00000000000000000000000000000000";

/// Fixed HMAC key for [`pfs_gen_crypto_key()`]. The same constant is baked
/// into the packager, so both sides derive identical EKPFS values.
const PFS_KDF_KEY: [u8; 32] = [
    0x4b, 0x19, 0x71, 0xe4, 0x2d, 0x06, 0x5c, 0x3e, 0xb8, 0xd4, 0x25, 0x9f, 0xaf, 0x0c, 0x90, 0x68,
    0x5e, 0x31, 0xc2, 0x17, 0x7a, 0xbb, 0x03, 0xde, 0x46, 0x8a, 0x9d, 0x51, 0xe0, 0x2f, 0x74, 0x1c,
];

/// AES key used by debug-mode packages for the image-key entry and the
/// license secret.
pub const DEBUG_KEY: [u8; 16] = [
    0xa3, 0x5d, 0x18, 0xc6, 0x91, 0x0e, 0x7f, 0x24, 0xd2, 0x68, 0xb0, 0x4b, 0x3c, 0xf7, 0x85, 0x92,
];

/// HMAC-SHA256 key derivation used for everything PFS related.
pub fn pfs_gen_crypto_key(key: &[u8], seed: &[u8], index: u32) -> [u8; 32] {
    let mut hmac: Hmac<Sha256> = Mac::new_from_slice(key).unwrap();
    let mut input = Vec::with_capacity(4 + seed.len());

    input.extend(index.to_le_bytes());
    input.extend_from_slice(seed);

    hmac.update(&input);
    hmac.finalize().into_bytes().into()
}

/// Derives EKPFS from the package passcode.
///
/// `EKPFS = HMAC-SHA256(pfs_gen_crypto_key("pfs_sig" || content_id, 1), passcode)`.
pub fn ekpfs_from_passcode(content_id: &str, passcode: &str) -> Result<[u8; 32], KeyError> {
    if passcode.len() != PASSCODE_LEN || !passcode.is_ascii() {
        return Err(KeyError::InvalidPasscode);
    }

    let mut seed = Vec::with_capacity(7 + content_id.len());

    seed.extend_from_slice(b"pfs_sig");
    seed.extend_from_slice(content_id.as_bytes());

    let key = pfs_gen_crypto_key(&PFS_KDF_KEY, &seed, 1);
    let mut hmac: Hmac<Sha256> = Mac::new_from_slice(&key).unwrap();

    hmac.update(passcode.as_bytes());

    Ok(hmac.finalize().into_bytes().into())
}

/// Gets XTS data key and tweak key for PFS blocks.
pub fn xts_keys(ekpfs: &[u8], seed: &[u8; 16], new_encryption: bool) -> ([u8; 16], [u8; 16]) {
    // Derive EKPFS from seed if PFS use new encryption.
    let ekpfs: Vec<u8> = if new_encryption {
        let mut hmac: Hmac<Sha256> = Mac::new_from_slice(ekpfs).unwrap();

        hmac.update(seed);

        hmac.finalize().into_bytes().to_vec()
    } else {
        ekpfs.into()
    };

    let secret = pfs_gen_crypto_key(&ekpfs, seed, 1);

    // Split key.
    let mut data_key = [0u8; 16];
    let mut tweak_key = [0u8; 16];

    tweak_key.copy_from_slice(&secret[..16]);
    data_key.copy_from_slice(&secret[16..]);

    (data_key, tweak_key)
}

/// Computes the MAC over the superblock key seed that the packager embeds in
/// the image. Key verification recomputes this and compares.
pub fn seed_mac(ekpfs: &[u8], seed: &[u8; 16]) -> [u8; 32] {
    let mut hmac: Hmac<Sha256> = Mac::new_from_slice(ekpfs).unwrap();

    hmac.update(seed);

    hmac.finalize().into_bytes().into()
}

/// Per-image secret for meta entries keyed on the passcode (key index 0-2).
pub fn passcode_entry_secret(content_id: &str, passcode: &str) -> Result<[u8; 32], KeyError> {
    if passcode.len() != PASSCODE_LEN || !passcode.is_ascii() {
        return Err(KeyError::InvalidPasscode);
    }

    let mut hmac: Hmac<Sha256> = Mac::new_from_slice(passcode.as_bytes()).unwrap();

    hmac.update(content_id.as_bytes());

    Ok(hmac.finalize().into_bytes().into())
}

/// Expands the CBC key and IV for one meta entry from its raw table record
/// and a secret. Returns `(iv, key)`.
pub fn entry_key(entry: &[u8; 32], secret: &[u8]) -> ([u8; 16], [u8; 16]) {
    let mut sha256 = Sha256::new();

    sha256.update(entry);
    sha256.update(secret);

    let secret = sha256.finalize();

    // Extract key and IV.
    let mut iv = [0u8; 16];
    let mut key = [0u8; 16];

    iv.copy_from_slice(&secret[..16]);
    key.copy_from_slice(&secret[16..]);

    (iv, key)
}

/// AES-128-CBC decryption without padding. `data` length must be a multiple
/// of the block size.
pub fn decrypt_cbc(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CipherError> {
    if data.len() % 16 != 0 {
        return Err(CipherError::BadLength(data.len()));
    }

    let mut decryptor = cbc::Decryptor::<Aes128>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(iv),
    );

    for block in data.chunks_exact_mut(16) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    Ok(())
}

/// Decrypts a debug-mode blob (image key entry, license secret) in place.
pub fn decrypt_debug(data: &mut [u8]) -> Result<(), CipherError> {
    decrypt_cbc(&DEBUG_KEY, &[0u8; 16], data)
}

/// AES-XTS cipher over fixed-size sectors.
///
/// The tweak input is the sector index as a big-endian u64 in the last
/// 8 bytes of the tweak block.
pub struct SectorCipher {
    cipher: Xts128<Aes128>,
    sector_size: usize,
}

impl SectorCipher {
    pub fn new(data_key: &[u8; 16], tweak_key: &[u8; 16], sector_size: usize) -> Self {
        let cipher_1 = Aes128::new(GenericArray::from_slice(data_key));
        let cipher_2 = Aes128::new(GenericArray::from_slice(tweak_key));

        Self {
            cipher: Xts128::new(cipher_1, cipher_2),
            sector_size,
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn decrypt_sector(&self, index: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len(), self.sector_size);
        self.cipher.decrypt_sector(sector, Self::tweak(index));
    }

    pub fn encrypt_sector(&self, index: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len(), self.sector_size);
        self.cipher.encrypt_sector(sector, Self::tweak(index));
    }

    fn tweak(index: u64) -> [u8; 16] {
        let mut tweak = [0u8; 16];

        tweak[8..].copy_from_slice(&index.to_be_bytes());

        tweak
    }
}

/// Errors for key derivation.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("passcode must be {PASSCODE_LEN} ASCII characters")]
    InvalidPasscode,
}

/// Errors for block cipher operations.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("data length {0} is not a multiple of the cipher block size")]
    BadLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT_ID: &str = "AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ";

    #[test]
    fn ekpfs_is_deterministic() {
        let a = ekpfs_from_passcode(CONTENT_ID, ZERO_PASSCODE).unwrap();
        let b = ekpfs_from_passcode(CONTENT_ID, ZERO_PASSCODE).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn ekpfs_depends_on_both_inputs() {
        let a = ekpfs_from_passcode(CONTENT_ID, ZERO_PASSCODE).unwrap();
        let b = ekpfs_from_passcode(CONTENT_ID, "10000000000000000000000000000000").unwrap();
        let c = ekpfs_from_passcode("AA0000-BBBB00000_00-YYYYYYYYYYYYYYYY", ZERO_PASSCODE).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn passcode_must_be_32_ascii() {
        assert!(ekpfs_from_passcode(CONTENT_ID, "short").is_err());
        assert!(ekpfs_from_passcode(CONTENT_ID, &"é".repeat(16)).is_err());
    }

    #[test]
    fn xts_round_trip() {
        let ekpfs = ekpfs_from_passcode(CONTENT_ID, ZERO_PASSCODE).unwrap();
        let seed = [7u8; 16];
        let (data_key, tweak_key) = xts_keys(&ekpfs, &seed, false);
        let cipher = SectorCipher::new(&data_key, &tweak_key, 0x1000);

        let mut sector = vec![0u8; 0x1000];

        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let plain = sector.clone();

        cipher.encrypt_sector(5, &mut sector);
        assert_ne!(sector, plain);

        cipher.decrypt_sector(5, &mut sector);
        assert_eq!(sector, plain);
    }

    #[test]
    fn xts_tweak_is_per_sector() {
        let cipher = SectorCipher::new(&[1u8; 16], &[2u8; 16], 0x1000);
        let mut a = vec![0xabu8; 0x1000];
        let mut b = vec![0xabu8; 0x1000];

        cipher.encrypt_sector(1, &mut a);
        cipher.encrypt_sector(2, &mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn new_encryption_changes_xts_keys() {
        let ekpfs = [9u8; 32];
        let seed = [3u8; 16];

        assert_ne!(xts_keys(&ekpfs, &seed, false), xts_keys(&ekpfs, &seed, true));
    }

    #[test]
    fn cbc_round_trip() {
        use aes::cipher::{BlockEncryptMut, KeyIvInit};

        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plain = *b"0123456789abcdef0123456789abcdef";
        let mut data = plain;

        let mut encryptor = cbc::Encryptor::<Aes128>::new(
            GenericArray::from_slice(&key),
            GenericArray::from_slice(&iv),
        );

        for block in data.chunks_exact_mut(16) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        assert_ne!(data, plain);

        decrypt_cbc(&key, &iv, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn cbc_rejects_partial_blocks() {
        let mut data = [0u8; 15];

        assert!(decrypt_cbc(&[0u8; 16], &[0u8; 16], &mut data).is_err());
    }

    #[test]
    fn entry_key_matches_the_packager_formula() {
        let entry = [0x5au8; 32];
        let secret = [0x77u8; 32];

        // (iv, key) is the split of SHA-256(entry record || secret) with
        // nothing else mixed in.
        let mut sha256 = Sha256::new();

        sha256.update(entry);
        sha256.update(secret);

        let digest = sha256.finalize();
        let (iv, key) = entry_key(&entry, &secret);

        assert_eq!(iv[..], digest[..16]);
        assert_eq!(key[..], digest[16..]);
    }

    #[test]
    fn entry_key_varies_with_the_entry_record() {
        let secret = [0x77u8; 32];
        let entry = [0x5au8; 32];
        let mut other = entry;

        other[16] ^= 1; // A different data offset.

        assert_ne!(entry_key(&entry, &secret), entry_key(&other, &secret));
    }
}
