use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

/// Persisted keys, keyed by content id (or `content_id-<digest8>` for XTS
/// keys tied to one specific image).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyStore {
    entries: BTreeMap<String, KeyRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    passcode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    ekpfs: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    xts: Option<XtsKeys>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XtsKeys {
    data: Vec<u8>,
    tweak: Vec<u8>,
}

impl KeyStore {
    /// Loads the store. A missing file is an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = match File::open(path) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(LoadError::OpenFailed(e)),
        };

        serde_json::from_reader(file).map_err(LoadError::ParseFailed)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SaveError> {
        let file = File::create(path).map_err(SaveError::CreateFailed)?;

        serde_json::to_writer_pretty(file, self).map_err(SaveError::WriteFailed)
    }

    pub fn passcode(&self, content_id: &str) -> Option<&str> {
        self.entries.get(content_id)?.passcode.as_deref()
    }

    pub fn ekpfs(&self, content_id: &str) -> Option<[u8; 32]> {
        self.entries
            .get(content_id)?
            .ekpfs
            .as_deref()
            .and_then(|v| v.try_into().ok())
    }

    pub fn xts(&self, key: &str) -> Option<([u8; 16], [u8; 16])> {
        let keys = self.entries.get(key)?.xts.as_ref()?;
        let data: [u8; 16] = keys.data.as_slice().try_into().ok()?;
        let tweak: [u8; 16] = keys.tweak.as_slice().try_into().ok()?;

        Some((data, tweak))
    }

    pub fn set_passcode(&mut self, content_id: &str, passcode: &str) {
        self.entries.entry(content_id.to_owned()).or_default().passcode = Some(passcode.to_owned());
    }

    pub fn set_ekpfs(&mut self, content_id: &str, ekpfs: &[u8; 32]) {
        self.entries.entry(content_id.to_owned()).or_default().ekpfs = Some(ekpfs.to_vec());
    }

    pub fn set_xts(&mut self, key: &str, data: &[u8; 16], tweak: &[u8; 16]) {
        self.entries.entry(key.to_owned()).or_default().xts = Some(XtsKeys {
            data: data.to_vec(),
            tweak: tweak.to_vec(),
        });
    }
}

/// Errors for [`load()`][KeyStore::load()].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot open key store")]
    OpenFailed(#[source] std::io::Error),

    #[error("cannot parse key store")]
    ParseFailed(#[source] serde_json::Error),
}

/// Errors for [`save()`][KeyStore::save()].
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("cannot create key store")]
    CreateFailed(#[source] std::io::Error),

    #[error("cannot write key store")]
    WriteFailed(#[source] serde_json::Error),
}
