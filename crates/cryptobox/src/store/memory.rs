//! In-memory store for tests and ephemeral boxes.
//!
//! Data is lost when the store is dropped.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use zeroize::Zeroizing;

use super::{IdentityStore, PreKeyStore, SessionStore};
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityMode, StoredIdentity};
use crate::ratchet::{PreKey, PreKeyId, LAST_PREKEY_ID};

#[derive(Default)]
pub struct MemoryStore {
    identity: Mutex<Option<Zeroizing<Vec<u8>>>>,
    prekeys: Mutex<BTreeMap<PreKeyId, PreKey>>,
    sessions: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, CryptoError> {
        self.identity
            .lock()
            .as_ref()
            .map(|record| StoredIdentity::deserialize(record))
            .transpose()
    }

    fn save_identity(&self, identity: &IdentityKeyPair, mode: IdentityMode) -> Result<(), CryptoError> {
        *self.identity.lock() = Some(StoredIdentity::encode(identity, mode));
        Ok(())
    }
}

impl PreKeyStore for MemoryStore {
    fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKey>, CryptoError> {
        Ok(self.prekeys.lock().get(&id).cloned())
    }

    fn store_prekey(&self, prekey: &PreKey) -> Result<(), CryptoError> {
        self.prekeys.lock().insert(prekey.id, prekey.clone());
        Ok(())
    }

    fn remove_prekey(&self, id: PreKeyId) -> Result<(), CryptoError> {
        if id != LAST_PREKEY_ID {
            self.prekeys.lock().remove(&id);
        }
        Ok(())
    }

    fn prekey_ids(&self) -> Result<Vec<PreKeyId>, CryptoError> {
        Ok(self.prekeys.lock().keys().copied().collect())
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
        Ok(self.sessions.lock().get(id).cloned())
    }

    fn store_session(&self, id: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(id.to_owned(), Zeroizing::new(data.to_vec()));
        Ok(())
    }

    fn delete_session(&self, id: &str) -> Result<(), CryptoError> {
        self.sessions.lock().remove(id);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
