use std::sync::Arc;

use parking_lot::Mutex;

use super::{BoxShared, ConsumedPreKey, PreKeyView};
use crate::error::{BoxError, CryptoError};
use crate::ratchet::{Envelope, Session};

/// A live session handed out by a [`CryptoBox`](crate::CryptoBox).
///
/// Operations are serialized per handle. Ratchet progress reaches the disk
/// only through [`save`](Self::save).
pub struct CryptoSession {
    id: String,
    inner: Mutex<Option<SessionInner>>,
}

struct SessionInner {
    session: Session,
    shared: Arc<BoxShared>,
    /// Prekeys consumed by this session, deleted from the store on save.
    pending_removals: Vec<ConsumedPreKey>,
}

impl CryptoSession {
    pub(crate) fn new(
        id: String,
        session: Session,
        shared: Arc<BoxShared>,
        pending_removals: Vec<ConsumedPreKey>,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(Some(SessionInner {
                session,
                shared,
                pending_removals,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub(crate) fn close(&self) {
        if self.inner.lock().take().is_some() {
            tracing::debug!(session = %self.id, "session closed");
        }
    }

    /// Run `f` on the open session. A panic-class failure closes the handle.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut SessionInner) -> Result<T, CryptoError>,
    ) -> Result<T, BoxError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(BoxError::SessionClosed)?;
        match f(inner) {
            Err(e @ CryptoError::Panic(_)) => {
                tracing::warn!(session = %self.id, error = %e, "closing session after internal error");
                *guard = None;
                Err(e.into())
            }
            other => other.map_err(BoxError::from),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BoxError> {
        self.with_session(|inner| inner.session.encrypt(plaintext)?.encode())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, BoxError> {
        let envelope = Envelope::decode(ciphertext)?;
        self.with_session(|inner| {
            let view = PreKeyView::new(&inner.shared);
            let plaintext = inner
                .session
                .decrypt(&view, &envelope, &inner.shared.config)?;
            inner.pending_removals.extend(view.into_removed());
            Ok(plaintext)
        })
    }

    /// Persist the session, then delete the prekeys it consumed.
    pub fn save(&self) -> Result<(), BoxError> {
        self.with_session(|inner| {
            let record = inner.session.serialize()?;
            inner.shared.store.store_session(&self.id, &record)?;
            while let Some(&(prekey_id, public)) = inner.pending_removals.last() {
                inner.shared.release_prekey(prekey_id, &public)?;
                inner.pending_removals.pop();
                tracing::debug!(session = %self.id, prekey_id, "removed consumed prekey");
            }
            tracing::debug!(session = %self.id, "session saved");
            Ok(())
        })
    }

    pub fn remote_fingerprint(&self) -> Result<String, BoxError> {
        self.with_session(|inner| Ok(inner.session.remote_identity().fingerprint()))
    }

    pub fn local_fingerprint(&self) -> Result<String, BoxError> {
        self.with_session(|inner| Ok(inner.session.local_identity().fingerprint()))
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{BoxConfig, CryptoBox};

    fn memory_box() -> CryptoBox {
        CryptoBox::open_with_store(Arc::new(MemoryStore::new()), BoxConfig::default()).unwrap()
    }

    #[test]
    fn internal_error_closes_the_handle() {
        let cbox = memory_box();
        let bundle = memory_box().new_last_prekey().unwrap().serialize();
        let session = cbox.session_from_prekey("peer", &bundle).unwrap();
        session.save().unwrap();

        let err = session.with_session(|_| -> Result<(), CryptoError> {
            Err(CryptoError::Panic("corrupt state".into()))
        });
        assert!(matches!(err, Err(BoxError::Crypto(CryptoError::Panic(_)))));
        assert!(session.is_closed());
        assert!(matches!(session.encrypt(b"x"), Err(BoxError::SessionClosed)));

        // The box reloads the last saved record instead of the dead handle.
        let reloaded = cbox.get_session("peer").unwrap();
        assert!(!reloaded.is_closed());
        assert!(reloaded.encrypt(b"x").is_ok());
    }

    #[test]
    fn other_errors_keep_the_handle_open() {
        let cbox = memory_box();
        let bundle = memory_box().new_last_prekey().unwrap().serialize();
        let session = cbox.session_from_prekey("peer", &bundle).unwrap();

        assert!(session.decrypt(b"not a message").is_err());
        assert!(!session.is_closed());
        assert_eq!(session.id(), "peer");
        assert_eq!(session.local_fingerprint().unwrap(), cbox.local_fingerprint().unwrap());
    }
}
