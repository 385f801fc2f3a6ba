//! End-to-end encrypted 1:1 sessions backed by an on-disk key store.
//!
//! A [`CryptoBox`] owns one long-term identity, a pool of prekeys and the
//! ratchet state of every session opened through it. Messages are opaque
//! byte buffers; delivering them is the caller's business.

pub mod cbox;
pub mod config;
pub mod error;
pub mod identity;
pub mod ratchet;
pub mod store;

pub use cbox::{fingerprint_prekey, CryptoBox, CryptoSession};
pub use config::BoxConfig;
pub use error::{BoxError, CryptoError};
pub use identity::{IdentityKeyPair, IdentityMode, IdentityPublicKey};
pub use ratchet::{Envelope, PreKey, PreKeyBundle, PreKeyId, Session, LAST_PREKEY_ID};
pub use store::{FileStore, KeyStore, MemoryStore};
