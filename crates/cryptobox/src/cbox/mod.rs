//! The box: one identity, its prekeys and a cache of live session handles,
//! all bound to a single storage root.

mod session;

pub use session::CryptoSession;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::config::BoxConfig;
use crate::error::{BoxError, CryptoError};
use crate::identity::{IdentityKeyPair, IdentityMode, StoredIdentity};
use crate::ratchet::{Envelope, PreKey, PreKeyBundle, PreKeyId, Session, LAST_PREKEY_ID};
use crate::store::{
    validate_session_id, FileStore, KeyStore, PreKeyStore,
};

/// State shared by a box and every session it hands out.
pub(crate) struct BoxShared {
    store: Arc<dyn KeyStore>,
    identity: Arc<IdentityKeyPair>,
    config: BoxConfig,
    /// Prekeys used by a session that has not been saved yet, by id and
    /// public key so a regenerated id is not mistaken for the used one.
    consumed: Mutex<HashMap<PreKeyId, PublicKey>>,
}

/// A prekey a session used, to be deleted when that session is saved.
pub(crate) type ConsumedPreKey = (PreKeyId, PublicKey);

impl BoxShared {
    fn is_consumed(&self, prekey: &PreKey) -> bool {
        self.consumed.lock().get(&prekey.id) == Some(prekey.key_pair.public())
    }

    /// Delete a used prekey unless its id has been given a new key since.
    fn release_prekey(&self, id: PreKeyId, public: &PublicKey) -> Result<(), CryptoError> {
        if let Some(stored) = self.store.load_prekey(id)? {
            if stored.key_pair.public() == public {
                self.store.remove_prekey(id)?;
            }
        }
        let mut consumed = self.consumed.lock();
        if consumed.get(&id) == Some(public) {
            consumed.remove(&id);
        }
        Ok(())
    }
}

/// The prekey store as seen by the ratchet: consumed prekeys are invisible
/// and removals are only recorded.
pub(crate) struct PreKeyView<'a> {
    shared: &'a BoxShared,
    removed: Mutex<Vec<ConsumedPreKey>>,
}

impl<'a> PreKeyView<'a> {
    fn new(shared: &'a BoxShared) -> Self {
        Self {
            shared,
            removed: Mutex::new(Vec::new()),
        }
    }

    fn into_removed(self) -> Vec<ConsumedPreKey> {
        self.removed.into_inner()
    }
}

impl PreKeyStore for PreKeyView<'_> {
    fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKey>, CryptoError> {
        let prekey = self.shared.store.load_prekey(id)?;
        Ok(prekey.filter(|prekey| !self.shared.is_consumed(prekey)))
    }

    fn store_prekey(&self, prekey: &PreKey) -> Result<(), CryptoError> {
        self.shared.store.store_prekey(prekey)
    }

    fn remove_prekey(&self, id: PreKeyId) -> Result<(), CryptoError> {
        if id == LAST_PREKEY_ID {
            return Ok(());
        }
        if let Some(prekey) = self.shared.store.load_prekey(id)? {
            let public = *prekey.key_pair.public();
            self.shared.consumed.lock().insert(id, public);
            self.removed.lock().push((id, public));
        }
        Ok(())
    }

    fn prekey_ids(&self) -> Result<Vec<PreKeyId>, CryptoError> {
        let consumed = self.shared.consumed.lock();
        let mut ids = self.shared.store.prekey_ids()?;
        ids.retain(|id| !consumed.contains_key(id));
        Ok(ids)
    }
}

struct BoxInner {
    shared: Arc<BoxShared>,
    sessions: HashMap<String, Arc<CryptoSession>>,
}

impl BoxInner {
    /// The cached handle for `id`, loading it from the store if needed.
    fn session(&mut self, id: &str) -> Result<Option<Arc<CryptoSession>>, CryptoError> {
        if let Some(handle) = self.cached(id) {
            return Ok(Some(handle));
        }
        let Some(record) = self.shared.store.load_session(id)? else {
            return Ok(None);
        };
        let session = Session::deserialize(Arc::clone(&self.shared.identity), &record)?;
        tracing::debug!(session = id, "session loaded");
        Ok(Some(self.insert(id, session, Vec::new())))
    }

    /// The cached handle for `id` unless it was closed by an internal error.
    fn cached(&self, id: &str) -> Option<Arc<CryptoSession>> {
        self.sessions
            .get(id)
            .filter(|handle| !handle.is_closed())
            .map(Arc::clone)
    }

    /// Cache a new handle for `id`. A previous handle for the id is closed.
    fn insert(&mut self, id: &str, session: Session, consumed: Vec<ConsumedPreKey>) -> Arc<CryptoSession> {
        let handle = Arc::new(CryptoSession::new(
            id.to_owned(),
            session,
            Arc::clone(&self.shared),
            consumed,
        ));
        if let Some(previous) = self.sessions.insert(id.to_owned(), Arc::clone(&handle)) {
            previous.close();
        }
        handle
    }

    fn validate(&self, id: &str) -> Result<(), CryptoError> {
        validate_session_id(id, self.shared.config.max_session_id_len)
    }
}

/// Sanity check of the OS RNG all key generation depends on.
fn check_rng() -> Result<(), CryptoError> {
    let mut sample = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut sample)
        .map_err(|e| CryptoError::InitError(format!("OS random number generator: {e}")))
}

/// A key store and session pool over one storage root.
///
/// Every method fails with [`BoxError::BoxClosed`] once [`close`](Self::close)
/// has been called. Opening two boxes over the same root at the same time is
/// not supported.
pub struct CryptoBox {
    inner: Mutex<Option<BoxInner>>,
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox").finish_non_exhaustive()
    }
}

impl CryptoBox {
    /// Open a storage root, creating a complete identity if it has none.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BoxError> {
        Self::open_with_config(root, BoxConfig::default())
    }

    pub fn open_with_config(root: impl AsRef<Path>, config: BoxConfig) -> Result<Self, BoxError> {
        config.validate()?;
        check_rng()?;
        let store = FileStore::open(root)?;
        Self::open_with_store(Arc::new(store), config)
    }

    /// Open a storage root with an externally held identity.
    ///
    /// `identity` must be a complete identity as exported by
    /// [`copy_identity`](Self::copy_identity). With [`IdentityMode::Public`]
    /// only its public half is written to the root.
    pub fn open_with(
        root: impl AsRef<Path>,
        identity: &[u8],
        mode: IdentityMode,
    ) -> Result<Self, BoxError> {
        Self::open_with_identity_config(root, identity, mode, BoxConfig::default())
    }

    pub fn open_with_identity_config(
        root: impl AsRef<Path>,
        identity: &[u8],
        mode: IdentityMode,
        config: BoxConfig,
    ) -> Result<Self, BoxError> {
        config.validate()?;
        check_rng()?;
        let store = FileStore::open(root)?;
        Self::open_store_with_identity(Arc::new(store), identity, mode, config)
    }

    /// Open over any store, with the semantics of [`open`](Self::open).
    pub fn open_with_store(store: Arc<dyn KeyStore>, config: BoxConfig) -> Result<Self, BoxError> {
        config.validate()?;
        let identity = match store.load_identity()? {
            Some(StoredIdentity::Complete(identity)) => identity,
            Some(StoredIdentity::Public(_)) => {
                return Err(CryptoError::IdentityError(
                    "stored identity is public only, open with the complete identity".into(),
                )
                .into())
            }
            None => {
                let identity = IdentityKeyPair::generate();
                store.save_identity(&identity, IdentityMode::Complete)?;
                tracing::debug!(fingerprint = %identity.fingerprint(), "generated new identity");
                identity
            }
        };
        Ok(Self::from_parts(store, identity, config))
    }

    /// Open over any store, with the semantics of [`open_with`](Self::open_with).
    pub fn open_store_with_identity(
        store: Arc<dyn KeyStore>,
        identity: &[u8],
        mode: IdentityMode,
        config: BoxConfig,
    ) -> Result<Self, BoxError> {
        config.validate()?;
        let identity = match StoredIdentity::deserialize(identity) {
            Ok(StoredIdentity::Complete(identity)) => identity,
            Ok(StoredIdentity::Public(_)) => {
                return Err(CryptoError::IdentityError(
                    "external identity must include the secret key".into(),
                )
                .into())
            }
            Err(e) => return Err(CryptoError::IdentityError(format!("invalid identity: {e}")).into()),
        };
        if let Some(stored) = store.load_identity()? {
            if stored.public_key() != identity.public_key() {
                return Err(CryptoError::IdentityError(
                    "identity does not match the one stored at this root".into(),
                )
                .into());
            }
        }
        store.save_identity(&identity, mode)?;
        Ok(Self::from_parts(store, identity, config))
    }

    fn from_parts(store: Arc<dyn KeyStore>, identity: IdentityKeyPair, config: BoxConfig) -> Self {
        tracing::debug!(fingerprint = %identity.fingerprint(), "box opened");
        let shared = Arc::new(BoxShared {
            store,
            identity: Arc::new(identity),
            config,
            consumed: Mutex::new(HashMap::new()),
        });
        Self {
            inner: Mutex::new(Some(BoxInner {
                shared,
                sessions: HashMap::new(),
            })),
        }
    }

    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut BoxInner) -> Result<T, CryptoError>,
    ) -> Result<T, BoxError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(BoxError::BoxClosed)?;
        Ok(f(inner)?)
    }

    /// Close the box and every session handle it gave out. Nothing is saved.
    pub fn close(&self) {
        if let Some(inner) = self.inner.lock().take() {
            for session in inner.sessions.values() {
                session.close();
            }
            tracing::debug!(sessions = inner.sessions.len(), "box closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub fn config(&self) -> Result<BoxConfig, BoxError> {
        self.with_inner(|inner| Ok(inner.shared.config.clone()))
    }

    pub fn local_fingerprint(&self) -> Result<String, BoxError> {
        self.with_inner(|inner| Ok(inner.shared.identity.fingerprint()))
    }

    /// Export the complete identity for [`open_with`](Self::open_with).
    pub fn copy_identity(&self) -> Result<Zeroizing<Vec<u8>>, BoxError> {
        self.with_inner(|inner| Ok(inner.shared.identity.serialize()))
    }

    /// Generate and store `count` prekeys with consecutive ids from `start`.
    /// Each replaces any stored prekey with the same id.
    ///
    /// Ids wrap around before the reserved last-resort id, so
    /// `new_prekeys(0xFFFC, 5)` yields `0xFFFC, 0xFFFD, 0xFFFE, 0, 1`.
    pub fn new_prekeys(&self, start: PreKeyId, count: u16) -> Result<Vec<PreKeyBundle>, BoxError> {
        self.with_inner(|inner| {
            let modulus = u32::from(LAST_PREKEY_ID);
            let mut bundles = Vec::with_capacity(count.into());
            for i in 0..u32::from(count) {
                let id = PreKeyId::try_from((u32::from(start) + i) % modulus)
                    .map_err(|_| CryptoError::Panic("prekey id out of range".into()))?;
                let prekey = PreKey::generate(id);
                inner.shared.store.store_prekey(&prekey)?;
                inner.shared.consumed.lock().remove(&id);
                bundles.push(prekey.bundle(&inner.shared.identity));
            }
            tracing::debug!(start, count, "generated prekeys");
            Ok(bundles)
        })
    }

    /// The last-resort prekey, generated on first use.
    pub fn new_last_prekey(&self) -> Result<PreKeyBundle, BoxError> {
        self.with_inner(|inner| {
            let prekey = match inner.shared.store.load_prekey(LAST_PREKEY_ID)? {
                Some(prekey) => prekey,
                None => {
                    let prekey = PreKey::last_resort();
                    inner.shared.store.store_prekey(&prekey)?;
                    tracing::debug!("generated last-resort prekey");
                    prekey
                }
            };
            Ok(prekey.bundle(&inner.shared.identity))
        })
    }

    /// Initiate session `id` from a peer's serialized prekey bundle.
    ///
    /// If a handle for `id` is already open it is returned unchanged.
    pub fn session_from_prekey(&self, id: &str, bundle: &[u8]) -> Result<Arc<CryptoSession>, BoxError> {
        self.with_inner(|inner| {
            inner.validate(id)?;
            if let Some(handle) = inner.cached(id) {
                return Ok(handle);
            }
            let bundle = PreKeyBundle::deserialize(bundle)?;
            let session = Session::init_from_prekey(Arc::clone(&inner.shared.identity), &bundle)?;
            tracing::debug!(session = id, prekey_id = bundle.prekey_id, "session initiated");
            Ok(inner.insert(id, session, Vec::new()))
        })
    }

    /// Decrypt an inbound message for session `id`, bootstrapping the session
    /// from it if `id` is unknown.
    pub fn session_from_message(
        &self,
        id: &str,
        message: &[u8],
    ) -> Result<(Arc<CryptoSession>, Vec<u8>), BoxError> {
        let known = self.with_inner(|inner| {
            inner.validate(id)?;
            inner.session(id)
        })?;
        if let Some(handle) = known {
            let plaintext = handle.decrypt(message)?;
            return Ok((handle, plaintext));
        }

        let envelope = Envelope::decode(message)?;
        self.with_inner(|inner| {
            // Another thread may have created the session in the meantime.
            if let Some(handle) = inner.cached(id) {
                return Ok((handle, None));
            }
            let view = PreKeyView::new(&inner.shared);
            let (session, plaintext) = Session::init_from_message(
                Arc::clone(&inner.shared.identity),
                &view,
                &envelope,
                &inner.shared.config,
            )?;
            let consumed = view.into_removed();
            tracing::debug!(
                session = id,
                prekeys = ?consumed.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "session initialised from message"
            );
            Ok((inner.insert(id, session, consumed), Some(plaintext)))
        })
        .and_then(|(handle, plaintext)| match plaintext {
            Some(plaintext) => Ok((handle, plaintext)),
            None => {
                let plaintext = handle.decrypt(message)?;
                Ok((handle, plaintext))
            }
        })
    }

    /// The handle of session `id`; `SessionNotFound` if it does not exist.
    pub fn get_session(&self, id: &str) -> Result<Arc<CryptoSession>, BoxError> {
        self.try_get_session(id)?
            .ok_or_else(|| CryptoError::SessionNotFound(id.to_owned()).into())
    }

    pub fn try_get_session(&self, id: &str) -> Result<Option<Arc<CryptoSession>>, BoxError> {
        self.with_inner(|inner| {
            inner.validate(id)?;
            inner.session(id)
        })
    }

    /// Close a session handle and drop it from the cache. Unsaved progress is lost.
    pub fn close_session(&self, session: &CryptoSession) -> Result<(), BoxError> {
        self.with_inner(|inner| {
            let cached = inner
                .sessions
                .get(session.id())
                .is_some_and(|handle| std::ptr::eq(Arc::as_ptr(handle), session));
            if cached {
                inner.sessions.remove(session.id());
            }
            session.close();
            Ok(())
        })
    }

    pub fn close_all_sessions(&self) -> Result<(), BoxError> {
        self.with_inner(|inner| {
            for (_, session) in inner.sessions.drain() {
                session.close();
            }
            Ok(())
        })
    }

    /// Close session `id` if open and delete its record.
    pub fn delete_session(&self, id: &str) -> Result<(), BoxError> {
        self.with_inner(|inner| {
            inner.validate(id)?;
            if let Some(session) = inner.sessions.remove(id) {
                session.close();
            }
            inner.shared.store.delete_session(id)?;
            tracing::debug!(session = id, "session deleted");
            Ok(())
        })
    }

    /// Ids of all sessions stored at this root.
    pub fn session_ids(&self) -> Result<Vec<String>, BoxError> {
        self.with_inner(|inner| inner.shared.store.list_sessions())
    }
}

impl Drop for CryptoBox {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fingerprint of the identity that signed a serialized prekey bundle.
pub fn fingerprint_prekey(bundle: &[u8]) -> Result<String, CryptoError> {
    let bundle = PreKeyBundle::deserialize(bundle)?;
    bundle.verify()?;
    Ok(bundle.identity_key.fingerprint())
}
