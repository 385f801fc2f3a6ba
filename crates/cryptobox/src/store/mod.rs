//! Persistence of identity, prekeys and sessions.
//!
//! All methods take `&self`; implementations handle their own locking.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityMode, StoredIdentity};
use crate::ratchet::{PreKey, PreKeyId};

/// Storage of the local identity.
pub trait IdentityStore: Send + Sync {
    /// The stored identity record, if any.
    fn load_identity(&self) -> Result<Option<StoredIdentity>, CryptoError>;

    /// Persist `identity`, keeping only its public half in [`IdentityMode::Public`].
    fn save_identity(&self, identity: &IdentityKeyPair, mode: IdentityMode)
        -> Result<(), CryptoError>;
}

/// Storage of prekeys, keyed by id.
///
/// One-time prekeys are removed once a session bootstrapped from them is saved.
pub trait PreKeyStore: Send + Sync {
    fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKey>, CryptoError>;

    /// Store a prekey, replacing any prekey with the same id.
    fn store_prekey(&self, prekey: &PreKey) -> Result<(), CryptoError>;

    /// Remove a consumed prekey. Removing an absent id is not an error, and
    /// the last-resort prekey ([`LAST_PREKEY_ID`](crate::LAST_PREKEY_ID)) is never removed.
    fn remove_prekey(&self, id: PreKeyId) -> Result<(), CryptoError>;

    fn prekey_ids(&self) -> Result<Vec<PreKeyId>, CryptoError>;
}

/// Storage of serialized sessions, keyed by session id.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError>;

    /// Atomically replace the record of session `id`.
    fn store_session(&self, id: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Delete a session. Deleting an absent session is not an error.
    fn delete_session(&self, id: &str) -> Result<(), CryptoError>;

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError>;
}

/// Everything a box needs from its storage root.
pub trait KeyStore: IdentityStore + PreKeyStore + SessionStore {}

impl<T: IdentityStore + PreKeyStore + SessionStore> KeyStore for T {}

/// Session ids are 1..=`max_len` bytes of `[A-Za-z0-9._@+=-]` and must not
/// start with a dot. They double as file names.
pub fn validate_session_id(id: &str, max_len: usize) -> Result<(), CryptoError> {
    if id.is_empty() || id.len() > max_len {
        return Err(CryptoError::InvalidString(format!(
            "session id length {} outside 1..={max_len}",
            id.len()
        )));
    }
    if id.starts_with('.') {
        return Err(CryptoError::InvalidString(
            "session id must not start with '.'".into(),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '=' | '-')))
    {
        return Err(CryptoError::InvalidString(format!(
            "session id contains disallowed character {c:?}"
        )));
    }
    Ok(())
}
