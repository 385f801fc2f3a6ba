//! Wire envelopes: plain ratchet messages and prekey (handshake) messages.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::PublicKey;

use crate::error::CryptoError;
use crate::identity::IdentityPublicKey;
use crate::ratchet::keys::PreKeyId;
use crate::ratchet::reader::Reader;

const WIRE_VERSION: u8 = 1;
const KIND_CIPHER: u8 = 1;
const KIND_PREKEY: u8 = 2;

/// Random identifier of one handshake, carried in every message of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTag([u8; 16]);

impl SessionTag {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A message encrypted under an established ratchet state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherMessage {
    pub session_tag: SessionTag,
    pub counter: u32,
    pub prev_counter: u32,
    pub ratchet_key: PublicKey,
    pub ciphertext: Vec<u8>,
}

/// A cipher message plus what a responder needs to bootstrap the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub prekey_id: PreKeyId,
    pub base_key: PublicKey,
    pub identity_key: IdentityPublicKey,
    pub message: CipherMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Cipher(CipherMessage),
    PreKey(PreKeyMessage),
}

impl Envelope {
    pub fn message(&self) -> &CipherMessage {
        match self {
            Self::Cipher(m) => m,
            Self::PreKey(p) => &p.message,
        }
    }

    pub(crate) fn message_mut(&mut self) -> &mut CipherMessage {
        match self {
            Self::Cipher(m) => m,
            Self::PreKey(p) => &mut p.message,
        }
    }

    pub fn is_prekey(&self) -> bool {
        matches!(self, Self::PreKey(_))
    }

    /// The authenticated part of the encoding: everything up to the
    /// ciphertext length.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 66 + 56);
        buf.push(WIRE_VERSION);
        match self {
            Self::Cipher(_) => buf.push(KIND_CIPHER),
            Self::PreKey(p) => {
                buf.push(KIND_PREKEY);
                buf.extend_from_slice(&p.prekey_id.to_be_bytes());
                buf.extend_from_slice(p.base_key.as_bytes());
                buf.extend_from_slice(&p.identity_key.to_bytes());
            }
        }
        let m = self.message();
        buf.extend_from_slice(m.session_tag.as_bytes());
        buf.extend_from_slice(&m.counter.to_be_bytes());
        buf.extend_from_slice(&m.prev_counter.to_be_bytes());
        buf.extend_from_slice(m.ratchet_key.as_bytes());
        buf
    }

    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = &self.message().ciphertext;
        let len = u32::try_from(ciphertext.len())
            .map_err(|_| CryptoError::InvalidMessage("ciphertext too large".into()))?;
        let mut buf = self.encode_header();
        buf.reserve(4 + ciphertext.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(ciphertext);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != WIRE_VERSION {
            return Err(CryptoError::DecodeError(format!(
                "unsupported message version {version}"
            )));
        }
        let envelope = match reader.read_u8()? {
            KIND_CIPHER => Self::Cipher(decode_cipher(&mut reader)?),
            KIND_PREKEY => {
                let prekey_id = reader.read_u16()?;
                let base_key = PublicKey::from(reader.read_array::<32>()?);
                let identity_key = IdentityPublicKey::from_bytes(&reader.read_array()?)
                    .map_err(|e| match e {
                        CryptoError::DegeneratedKey(msg) => CryptoError::InvalidMessage(msg),
                        other => other,
                    })?;
                Self::PreKey(PreKeyMessage {
                    prekey_id,
                    base_key,
                    identity_key,
                    message: decode_cipher(&mut reader)?,
                })
            }
            other => {
                return Err(CryptoError::DecodeError(format!("unknown message kind {other}")))
            }
        };
        reader.finish()?;
        Ok(envelope)
    }
}

fn decode_cipher(reader: &mut Reader<'_>) -> Result<CipherMessage, CryptoError> {
    let session_tag = SessionTag::from_bytes(reader.read_array()?);
    let counter = reader.read_u32()?;
    let prev_counter = reader.read_u32()?;
    let ratchet_key = PublicKey::from(reader.read_array::<32>()?);
    let len = reader.read_u32()? as usize;
    let ciphertext = reader.read_bytes(len)?.to_vec();
    Ok(CipherMessage {
        session_tag,
        counter,
        prev_counter,
        ratchet_key,
        ciphertext,
    })
}
