//! HKDF-SHA256 derivations of the ratchet and the AEAD built on them.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::ratchet::keys::KeyPair;
use crate::ratchet::reader::Reader;

const INFO_HANDSHAKE: &[u8] = b"cryptobox_handshake";
const INFO_ROOT: &[u8] = b"cryptobox_root";
const INFO_MESSAGE: &[u8] = b"cryptobox_message";
const INFO_CHAIN: &[u8] = b"cryptobox_chain";

fn expand(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, okm)
        .map_err(|e| CryptoError::Panic(format!("HKDF expand failed: {e}")))
}

/// Split the X3DH master secret into the first root key and chain key.
pub(crate) fn derive_secrets(master: &[u8]) -> Result<(RootKey, ChainKey), CryptoError> {
    let mut okm = [0u8; 64];
    expand(None, master, INFO_HANDSHAKE, &mut okm)?;
    let pair = split(&okm);
    okm.zeroize();
    Ok(pair)
}

fn split(okm: &[u8; 64]) -> (RootKey, ChainKey) {
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (RootKey(root), ChainKey::new(chain, 0))
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct RootKey([u8; 32]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One DH ratchet step: mixes `DH(ours, theirs)` into the root key.
    pub fn dh_ratchet(
        &self,
        ours: &KeyPair,
        theirs: &PublicKey,
    ) -> Result<(RootKey, ChainKey), CryptoError> {
        let shared = ours.dh(theirs)?;
        let mut okm = [0u8; 64];
        expand(Some(&self.0), shared.as_ref(), INFO_ROOT, &mut okm)?;
        let pair = split(&okm);
        okm.zeroize();
        Ok(pair)
    }
}

/// A symmetric chain key and its position in the chain.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ChainKey {
    key: [u8; 32],
    idx: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], idx: u32) -> Self {
        Self { key, idx }
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Advance one step. Exhausting the 32-bit counter is fatal for the session.
    pub fn next(&self) -> Result<ChainKey, CryptoError> {
        let idx = self
            .idx
            .checked_add(1)
            .ok_or_else(|| CryptoError::Panic("chain counter exhausted".into()))?;
        let mut key = [0u8; 32];
        expand(None, &self.key, INFO_CHAIN, &mut key)?;
        Ok(Self { key, idx })
    }

    /// Message key for the current position.
    pub fn message_keys(&self) -> Result<MessageKeys, CryptoError> {
        let mut okm = [0u8; 44];
        expand(None, &self.key, INFO_MESSAGE, &mut okm)?;
        let mut keys = MessageKeys {
            cipher_key: [0u8; 32],
            nonce: [0u8; 12],
            counter: self.idx,
        };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok(keys)
    }
}

/// Single-use AEAD key material for the message at `counter`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKeys {
    cipher_key: [u8; 32],
    nonce: [u8; 12],
    pub counter: u32,
}

impl MessageKeys {
    pub const ENCODED_LEN: usize = 32 + 12 + 4;

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| CryptoError::Panic(format!("invalid AES key: {e}")))
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .encrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::Panic(format!("AES-GCM encrypt failed: {e}")))
    }

    /// Tag mismatch, whether from tampering or a wrong key, is an invalid signature.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.cipher_key);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.counter.to_be_bytes());
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher_key: reader.read_array()?,
            nonce: reader.read_array()?,
            counter: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_steps_are_deterministic_and_distinct() {
        let (_, chain) = derive_secrets(&[7u8; 96]).unwrap();
        let (_, again) = derive_secrets(&[7u8; 96]).unwrap();
        assert_eq!(chain.as_bytes(), again.as_bytes());

        let next = chain.next().unwrap();
        assert_eq!(next.idx(), 1);
        assert_ne!(next.as_bytes(), chain.as_bytes());
        assert_ne!(
            chain.message_keys().unwrap().cipher_key,
            next.message_keys().unwrap().cipher_key
        );
        assert_eq!(next.message_keys().unwrap().counter, 1);
    }

    #[test]
    fn exhausted_chain_is_a_panic() {
        let chain = ChainKey::new([1u8; 32], u32::MAX);
        assert!(matches!(chain.next(), Err(CryptoError::Panic(_))));
    }

    #[test]
    fn both_sides_of_a_dh_step_agree() {
        let root = RootKey::from_bytes([3u8; 32]);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (root_a, chain_a) = root.dh_ratchet(&a, b.public()).unwrap();
        let (root_b, chain_b) = root.dh_ratchet(&b, a.public()).unwrap();
        assert_eq!(root_a.as_bytes(), root_b.as_bytes());
        assert_eq!(chain_a.as_bytes(), chain_b.as_bytes());
        assert_ne!(root_a.as_bytes(), root.as_bytes());
    }

    #[test]
    fn aead_binds_the_header() {
        let keys = ChainKey::new([9u8; 32], 0).message_keys().unwrap();
        let ciphertext = keys.encrypt(b"payload", b"header").unwrap();
        assert_eq!(keys.decrypt(&ciphertext, b"header").unwrap(), b"payload");
        assert!(matches!(
            keys.decrypt(&ciphertext, b"other header"),
            Err(CryptoError::InvalidSignature)
        ));

        let mut tampered = ciphertext.clone();
        tampered[0] ^= 1;
        assert!(matches!(
            keys.decrypt(&tampered, b"header"),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn message_keys_survive_encoding() {
        let keys = ChainKey::new([5u8; 32], 12).message_keys().unwrap();
        let mut buf = Vec::new();
        keys.encode_into(&mut buf);
        assert_eq!(buf.len(), MessageKeys::ENCODED_LEN);

        let mut reader = Reader::new(&buf);
        let decoded = MessageKeys::decode(&mut reader).unwrap();
        reader.finish().unwrap();
        assert_eq!(decoded.counter, 12);
        let ciphertext = keys.encrypt(b"x", b"").unwrap();
        assert_eq!(decoded.decrypt(&ciphertext, b"").unwrap(), b"x");
    }
}
