use std::collections::VecDeque;
use std::sync::Arc;

use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::config::BoxConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::ratchet::keys::{KeyPair, PreKeyBundle, PreKeyId, LAST_PREKEY_ID};
use crate::ratchet::message::{Envelope, PreKeyMessage, SessionTag};
use crate::ratchet::reader::Reader;
use crate::ratchet::state::SessionState;
use crate::store::PreKeyStore;

const RECORD_VERSION: u8 = 1;

/// What the initiator repeats in every message until the peer answers.
#[derive(Debug, Clone, Copy)]
struct PendingPreKey {
    prekey_id: PreKeyId,
    base_key: PublicKey,
}

/// A ratchet session with one remote identity.
///
/// Holds one state per handshake, newest first. Encryption always uses the
/// newest; decryption picks the state named by the message's session tag.
pub struct Session {
    local_identity: Arc<IdentityKeyPair>,
    remote_identity: IdentityPublicKey,
    pending_prekey: Option<PendingPreKey>,
    states: VecDeque<(SessionTag, SessionState)>,
}

impl Session {
    /// Start a session as initiator from the peer's signed prekey bundle.
    pub fn init_from_prekey(
        local_identity: Arc<IdentityKeyPair>,
        bundle: &PreKeyBundle,
    ) -> Result<Self, CryptoError> {
        bundle.verify()?;
        let base_key = KeyPair::generate();
        let state = SessionState::init_as_alice(&local_identity, &base_key, bundle)?;
        let tag = SessionTag::random();
        tracing::debug!(
            prekey_id = bundle.prekey_id,
            session_tag = %tag,
            "initialised session from prekey bundle"
        );
        Ok(Self {
            local_identity,
            remote_identity: bundle.identity_key,
            pending_prekey: Some(PendingPreKey {
                prekey_id: bundle.prekey_id,
                base_key: *base_key.public(),
            }),
            states: VecDeque::from([(tag, state)]),
        })
    }

    /// Start a session as responder from an inbound prekey message, returning
    /// the session and the plaintext of that message.
    ///
    /// The referenced one-time prekey is removed from `store` on success.
    pub fn init_from_message(
        local_identity: Arc<IdentityKeyPair>,
        store: &dyn PreKeyStore,
        envelope: &Envelope,
        config: &BoxConfig,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let Envelope::PreKey(prekey_message) = envelope else {
            return Err(CryptoError::InvalidMessage(
                "session init requires a prekey message".into(),
            ));
        };
        let mut session = Self {
            local_identity,
            remote_identity: prekey_message.identity_key,
            pending_prekey: None,
            states: VecDeque::new(),
        };
        let (state, plaintext) = session.new_state(store, prekey_message, envelope, config)?;
        session.consume_prekey(store, prekey_message.prekey_id)?;
        session.insert_state(prekey_message.message.session_tag, state, config);
        Ok((session, plaintext))
    }

    pub fn local_identity(&self) -> &IdentityKeyPair {
        &self.local_identity
    }

    pub fn remote_identity(&self) -> &IdentityPublicKey {
        &self.remote_identity
    }

    /// Tag of the state new messages are encrypted under.
    pub fn session_tag(&self) -> Option<SessionTag> {
        self.states.front().map(|(tag, _)| *tag)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Whether outgoing messages still carry the handshake.
    pub fn has_pending_prekey(&self) -> bool {
        self.pending_prekey.is_some()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let identity_key = self.local_identity.public_key();
        let pending = self.pending_prekey;
        let (tag, state) = self
            .states
            .front_mut()
            .ok_or_else(|| CryptoError::Panic("session has no state".into()))?;
        state.encrypt(*tag, plaintext, |message| match pending {
            Some(p) => Envelope::PreKey(PreKeyMessage {
                prekey_id: p.prekey_id,
                base_key: p.base_key,
                identity_key,
                message,
            }),
            None => Envelope::Cipher(message),
        })
    }

    /// Decrypt an inbound envelope. On error the session is left unchanged.
    ///
    /// A prekey message whose tag is unknown, or which does not decrypt under
    /// its tag's state, bootstraps a new state from the referenced prekey.
    pub fn decrypt(
        &mut self,
        store: &dyn PreKeyStore,
        envelope: &Envelope,
        config: &BoxConfig,
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = match envelope {
            Envelope::Cipher(_) => self.decrypt_existing(envelope, config)?,
            Envelope::PreKey(prekey_message) => {
                if prekey_message.identity_key != self.remote_identity {
                    return Err(CryptoError::RemoteIdentityChanged);
                }
                match self.decrypt_existing(envelope, config) {
                    Ok(plaintext) => plaintext,
                    Err(e @ (CryptoError::InvalidSignature | CryptoError::InvalidMessage(_))) => {
                        let (state, plaintext) =
                            match self.new_state(store, prekey_message, envelope, config) {
                                Ok(bootstrapped) => bootstrapped,
                                Err(CryptoError::PreKeyNotFound(_)) => return Err(e),
                                Err(other) => return Err(other),
                            };
                        self.consume_prekey(store, prekey_message.prekey_id)?;
                        self.insert_state(prekey_message.message.session_tag, state, config);
                        plaintext
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        self.pending_prekey = None;
        Ok(plaintext)
    }

    fn decrypt_existing(&mut self, envelope: &Envelope, config: &BoxConfig) -> Result<Vec<u8>, CryptoError> {
        let tag = envelope.message().session_tag;
        let (_, state) = self
            .states
            .iter_mut()
            .find(|(t, _)| *t == tag)
            .ok_or_else(|| CryptoError::InvalidMessage(format!("unknown session tag {tag}")))?;
        let mut candidate = state.clone();
        let plaintext = candidate.decrypt(envelope, config)?;
        *state = candidate;
        Ok(plaintext)
    }

    fn new_state(
        &self,
        store: &dyn PreKeyStore,
        prekey_message: &PreKeyMessage,
        envelope: &Envelope,
        config: &BoxConfig,
    ) -> Result<(SessionState, Vec<u8>), CryptoError> {
        let prekey = store
            .load_prekey(prekey_message.prekey_id)?
            .ok_or(CryptoError::PreKeyNotFound(prekey_message.prekey_id))?;
        // The sender chose these keys; a low-order one makes the message invalid.
        let mut state = SessionState::init_as_bob(
            &self.local_identity,
            &prekey.key_pair,
            &prekey_message.identity_key,
            &prekey_message.base_key,
        )
        .map_err(|e| match e {
            CryptoError::DegeneratedKey(msg) => CryptoError::InvalidMessage(msg),
            other => other,
        })?;
        let plaintext = state.decrypt(envelope, config)?;
        Ok((state, plaintext))
    }

    fn consume_prekey(&self, store: &dyn PreKeyStore, id: PreKeyId) -> Result<(), CryptoError> {
        if id != LAST_PREKEY_ID {
            store.remove_prekey(id)?;
        }
        Ok(())
    }

    fn insert_state(&mut self, tag: SessionTag, state: SessionState, config: &BoxConfig) {
        self.states.retain(|(t, _)| *t != tag);
        self.states.push_front((tag, state));
        while self.states.len() > config.max_session_states {
            if let Some((evicted, _)) = self.states.pop_back() {
                tracing::warn!(session_tag = %evicted, "evicted oldest session state");
            }
        }
    }

    /// `version | local [32] | remote [32] | pending flag [id u16 | base [32]]
    /// | count u16 | (tag [16] | state)*`
    pub fn serialize(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buf = Zeroizing::new(Vec::with_capacity(256));
        buf.push(RECORD_VERSION);
        buf.extend_from_slice(&self.local_identity.public_key().to_bytes());
        buf.extend_from_slice(&self.remote_identity.to_bytes());
        match self.pending_prekey {
            Some(p) => {
                buf.push(1);
                buf.extend_from_slice(&p.prekey_id.to_be_bytes());
                buf.extend_from_slice(p.base_key.as_bytes());
            }
            None => buf.push(0),
        }
        let count = u16::try_from(self.states.len())
            .map_err(|_| CryptoError::Panic("too many session states".into()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for (tag, state) in &self.states {
            buf.extend_from_slice(tag.as_bytes());
            state.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Restore a session record. It must belong to `local_identity`.
    pub fn deserialize(local_identity: Arc<IdentityKeyPair>, data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != RECORD_VERSION {
            return Err(CryptoError::DecodeError(format!(
                "unsupported session version {version}"
            )));
        }
        let local = reader.read_array::<32>()?;
        if local != local_identity.public_key().to_bytes() {
            return Err(CryptoError::IdentityError(
                "session belongs to a different local identity".into(),
            ));
        }
        let remote_identity = IdentityPublicKey::from_bytes(&reader.read_array()?)?;
        let pending_prekey = if reader.read_flag()? {
            Some(PendingPreKey {
                prekey_id: reader.read_u16()?,
                base_key: PublicKey::from(reader.read_array::<32>()?),
            })
        } else {
            None
        };
        let count = reader.read_u16()?;
        if count == 0 {
            return Err(CryptoError::DecodeError("session without state".into()));
        }
        let mut states = VecDeque::with_capacity(count.into());
        for _ in 0..count {
            let tag = SessionTag::from_bytes(reader.read_array()?);
            states.push_back((tag, SessionState::decode(&mut reader)?));
        }
        reader.finish()?;
        Ok(Self {
            local_identity,
            remote_identity,
            pending_prekey,
            states,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_identity", &self.remote_identity)
            .field("states", &self.states.len())
            .field("pending_prekey", &self.pending_prekey.map(|p| p.prekey_id))
            .finish_non_exhaustive()
    }
}
