//! X25519 key pairs, prekeys and the public prekey bundles peers
//! initiate sessions from.

use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::ratchet::reader::Reader;

/// Prekey identifiers form a 16-bit namespace.
pub type PreKeyId = u16;

/// Reserved id of the last-resort prekey. It is never removed on use.
pub const LAST_PREKEY_ID: PreKeyId = u16::MAX;

const RECORD_VERSION: u8 = 1;
const BUNDLE_VERSION: u8 = 1;

/// Diffie-Hellman that refuses non-contributory results (low-order peer keys).
pub(crate) fn agree(
    secret: &StaticSecret,
    public: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::DegeneratedKey(
            "non-contributory key agreement".into(),
        ));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// An X25519 key pair (prekeys, base keys, ratchet keys).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn dh(&self, their_public: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        agree(&self.secret, their_public)
    }
}

/// A prekey with its private half, as kept in the prekey store.
#[derive(Clone)]
pub struct PreKey {
    pub id: PreKeyId,
    pub key_pair: KeyPair,
}

impl PreKey {
    pub fn generate(id: PreKeyId) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
        }
    }

    pub fn last_resort() -> Self {
        Self::generate(LAST_PREKEY_ID)
    }

    pub fn is_last_resort(&self) -> bool {
        self.id == LAST_PREKEY_ID
    }

    /// The signed public bundle for this prekey.
    pub fn bundle(&self, identity: &IdentityKeyPair) -> PreKeyBundle {
        PreKeyBundle::signed(identity, self.id, *self.key_pair.public())
    }

    /// `version | id u16 | secret [32]`
    pub fn serialize(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(3 + 32));
        buf.push(RECORD_VERSION);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(self.key_pair.secret_bytes().as_ref());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != RECORD_VERSION {
            return Err(CryptoError::DecodeError(format!(
                "unsupported prekey version {version}"
            )));
        }
        let id = reader.read_u16()?;
        let secret = reader.read_array::<32>()?;
        reader.finish()?;
        Ok(Self {
            id,
            key_pair: KeyPair::from_secret_bytes(secret),
        })
    }
}

impl std::fmt::Debug for PreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKey")
            .field("id", &self.id)
            .field("public", &hex::encode(self.key_pair.public().as_bytes()))
            .finish()
    }
}

/// Public material a peer needs to open a session with the prekey's owner.
#[derive(Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub prekey_id: PreKeyId,
    pub public_key: PublicKey,
    pub identity_key: IdentityPublicKey,
    /// Signature by `identity_key` over `public_key`.
    pub signature: Signature,
}

impl PreKeyBundle {
    pub fn signed(identity: &IdentityKeyPair, prekey_id: PreKeyId, public_key: PublicKey) -> Self {
        Self {
            prekey_id,
            public_key,
            identity_key: identity.public_key(),
            signature: identity.sign(public_key.as_bytes()),
        }
    }

    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity_key
            .verify(self.public_key.as_bytes(), &self.signature)
    }

    /// `version | prekey_id u16 | prekey [32] | identity [32] | signature [64]`
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + 32 + 32 + 64);
        buf.push(BUNDLE_VERSION);
        buf.extend_from_slice(&self.prekey_id.to_be_bytes());
        buf.extend_from_slice(self.public_key.as_bytes());
        buf.extend_from_slice(&self.identity_key.to_bytes());
        buf.extend_from_slice(&self.signature.to_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != BUNDLE_VERSION {
            return Err(CryptoError::DecodeError(format!(
                "unsupported prekey bundle version {version}"
            )));
        }
        let prekey_id = reader.read_u16()?;
        let public_key = PublicKey::from(reader.read_array::<32>()?);
        let identity_key = IdentityPublicKey::from_bytes(&reader.read_array()?)?;
        let signature = Signature::from_bytes(&reader.read_array()?);
        reader.finish()?;
        Ok(Self {
            prekey_id,
            public_key,
            identity_key,
            signature,
        })
    }
}

impl std::fmt::Debug for PreKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyBundle")
            .field("prekey_id", &self.prekey_id)
            .field("identity_key", &self.identity_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_symmetry() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(*a.dh(b.public()).unwrap(), *b.dh(a.public()).unwrap());
    }

    #[test]
    fn low_order_point_is_degenerate() {
        let a = KeyPair::generate();
        let zero = PublicKey::from([0u8; 32]);
        assert!(matches!(a.dh(&zero), Err(CryptoError::DegeneratedKey(_))));
    }

    #[test]
    fn prekey_record_roundtrip() {
        let prekey = PreKey::generate(42);
        let restored = PreKey::deserialize(&prekey.serialize()).unwrap();
        assert_eq!(restored.id, 42);
        assert_eq!(restored.key_pair.public(), prekey.key_pair.public());
        assert!(!restored.is_last_resort());
        assert!(PreKey::last_resort().is_last_resort());
    }

    #[test]
    fn bundle_is_signed_by_owner() {
        let identity = IdentityKeyPair::generate();
        let prekey = PreKey::generate(7);
        let bundle = prekey.bundle(&identity);
        assert!(bundle.verify().is_ok());

        let decoded = PreKeyBundle::deserialize(&bundle.serialize()).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(decoded.identity_key.fingerprint(), identity.fingerprint());
    }

    #[test]
    fn forged_bundle_fails_verification() {
        let owner = IdentityKeyPair::generate();
        let mut bundle = PreKey::generate(1).bundle(&owner);
        bundle.public_key = *PreKey::generate(1).key_pair.public();
        assert!(matches!(bundle.verify(), Err(CryptoError::InvalidSignature)));

        let mallory = IdentityKeyPair::generate();
        let mut resigned = PreKey::generate(2).bundle(&owner);
        resigned.signature = mallory.sign(resigned.public_key.as_bytes());
        assert!(resigned.verify().is_err());
    }

    #[test]
    fn malformed_bundle_is_a_decode_error() {
        let identity = IdentityKeyPair::generate();
        let bytes = PreKey::generate(1).bundle(&identity).serialize();
        assert!(matches!(
            PreKeyBundle::deserialize(&bytes[..bytes.len() - 1]),
            Err(CryptoError::DecodeError(_))
        ));
        let mut wrong_version = bytes.clone();
        wrong_version[0] = 9;
        assert!(PreKeyBundle::deserialize(&wrong_version).is_err());
    }
}
