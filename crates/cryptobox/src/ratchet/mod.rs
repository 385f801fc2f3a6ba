//! The double ratchet engine: X3DH handshakes, chain derivation and the
//! message wire format.

mod kdf;
mod keys;
mod message;
pub(crate) mod reader;
mod session;
mod state;

pub use keys::{KeyPair, PreKey, PreKeyBundle, PreKeyId, LAST_PREKEY_ID};
pub use message::{CipherMessage, Envelope, PreKeyMessage, SessionTag};
pub use session::Session;
