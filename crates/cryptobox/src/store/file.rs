//! Directory-backed store.
//!
//! ```text
//! <root>/identities/local
//! <root>/prekeys/<id>
//! <root>/sessions/<session id>
//! ```
//!
//! Every record is written to a hidden temporary file first and renamed into
//! place, so a crash never leaves a half-written record behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use super::{validate_session_id, IdentityStore, PreKeyStore, SessionStore};
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityMode, StoredIdentity};
use crate::ratchet::{PreKey, PreKeyId, LAST_PREKEY_ID};

const IDENTITY_DIR: &str = "identities";
const PREKEY_DIR: &str = "prekeys";
const SESSION_DIR: &str = "sessions";
const LOCAL_IDENTITY: &str = "local";

/// Largest id the file layout accepts, independent of the box configuration.
const MAX_FILE_NAME: usize = 255;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store layout under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let root = root.as_ref().to_path_buf();
        for dir in [IDENTITY_DIR, PREKEY_DIR, SESSION_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        tracing::debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_path(&self) -> PathBuf {
        self.root.join(IDENTITY_DIR).join(LOCAL_IDENTITY)
    }

    fn prekey_path(&self, id: PreKeyId) -> PathBuf {
        self.root.join(PREKEY_DIR).join(id.to_string())
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, CryptoError> {
        validate_session_id(id, MAX_FILE_NAME)?;
        Ok(self.root.join(SESSION_DIR).join(id))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CryptoError::StorageError(format!("invalid path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{name}.tmp"));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CryptoError::from(e)
    })
}

fn read_optional(path: &Path) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(Zeroizing::new(data))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), CryptoError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Visible (non-temporary) file names of a directory.
fn file_names(dir: &Path) -> Result<Vec<String>, CryptoError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
    }
    Ok(names)
}

impl IdentityStore for FileStore {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, CryptoError> {
        let Some(data) = read_optional(&self.identity_path())? else {
            return Ok(None);
        };
        StoredIdentity::deserialize(&data).map(Some).map_err(|e| {
            tracing::warn!(error = %e, "identity record failed to decode");
            e
        })
    }

    fn save_identity(&self, identity: &IdentityKeyPair, mode: IdentityMode) -> Result<(), CryptoError> {
        write_atomic(&self.identity_path(), &StoredIdentity::encode(identity, mode))
    }
}

impl PreKeyStore for FileStore {
    fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKey>, CryptoError> {
        let Some(data) = read_optional(&self.prekey_path(id))? else {
            return Ok(None);
        };
        let prekey = PreKey::deserialize(&data).map_err(|e| {
            tracing::warn!(error = %e, prekey_id = id, "prekey record failed to decode");
            e
        })?;
        if prekey.id != id {
            return Err(CryptoError::DecodeError(format!(
                "prekey record {id} holds prekey {}",
                prekey.id
            )));
        }
        Ok(Some(prekey))
    }

    fn store_prekey(&self, prekey: &PreKey) -> Result<(), CryptoError> {
        write_atomic(&self.prekey_path(prekey.id), &prekey.serialize())
    }

    fn remove_prekey(&self, id: PreKeyId) -> Result<(), CryptoError> {
        if id == LAST_PREKEY_ID {
            return Ok(());
        }
        remove_optional(&self.prekey_path(id))
    }

    fn prekey_ids(&self) -> Result<Vec<PreKeyId>, CryptoError> {
        let mut ids: Vec<PreKeyId> = file_names(&self.root.join(PREKEY_DIR))?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl SessionStore for FileStore {
    fn load_session(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
        read_optional(&self.session_path(id)?)
    }

    fn store_session(&self, id: &str, data: &[u8]) -> Result<(), CryptoError> {
        write_atomic(&self.session_path(id)?, data)
    }

    fn delete_session(&self, id: &str) -> Result<(), CryptoError> {
        remove_optional(&self.session_path(id)?)
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        let mut ids = file_names(&self.root.join(SESSION_DIR))?;
        ids.sort();
        Ok(ids)
    }
}
