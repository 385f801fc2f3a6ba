use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::ratchet::reader::Reader;

const RECORD_VERSION: u8 = 1;
const MODE_COMPLETE: u8 = 1;
const MODE_PUBLIC: u8 = 2;

/// How much of an identity a storage root keeps on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Secret and public key are persisted.
    Complete,
    /// Only the public key is persisted; the secret is supplied on every open.
    Public,
}

/// The long-term identity key pair of a box.
///
/// Ed25519 for signatures; its Montgomery form serves the X3DH key agreement.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            key: self.signing_key.verifying_key(),
        }
    }

    /// Secret key bytes.
    ///
    /// # Security
    /// Raw private key material.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 secret for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar so that its public half matches
    /// [`IdentityPublicKey::to_x25519`] of our own public key.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Hex fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }

    /// Export in the complete identity format accepted by
    /// [`StoredIdentity::deserialize`].
    pub fn serialize(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(2 + 64));
        buf.push(RECORD_VERSION);
        buf.push(MODE_COMPLETE);
        buf.extend_from_slice(self.signing_key.as_bytes());
        buf.extend_from_slice(&self.public_key().to_bytes());
        buf
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.fingerprint())
            .finish()
    }
}

/// Public half of an identity. This is what peers pin and verify.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublicKey {
    key: VerifyingKey,
}

impl IdentityPublicKey {
    /// Parse 32 public key bytes, rejecting invalid and small-order points.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::DecodeError(format!("invalid identity key: {e}")))?;
        if key.is_weak() {
            return Err(CryptoError::DegeneratedKey("small-order identity key".into()));
        }
        Ok(Self { key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Deterministic, non-secret fingerprint: lowercase hex of the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// X25519 form via the Edwards→Montgomery map (RFC 7748).
    pub fn to_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.key.to_montgomery().to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.key
            .verify(message, signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityPublicKey")
            .field(&self.fingerprint())
            .finish()
    }
}

/// Identity material as found on disk or handed in by a caller.
#[derive(Debug)]
pub enum StoredIdentity {
    Complete(IdentityKeyPair),
    Public(IdentityPublicKey),
}

impl StoredIdentity {
    pub fn public_key(&self) -> IdentityPublicKey {
        match self {
            Self::Complete(pair) => pair.public_key(),
            Self::Public(key) => *key,
        }
    }

    pub fn mode(&self) -> IdentityMode {
        match self {
            Self::Complete(_) => IdentityMode::Complete,
            Self::Public(_) => IdentityMode::Public,
        }
    }

    /// Encode `identity` as a record of the given completeness.
    pub fn encode(identity: &IdentityKeyPair, mode: IdentityMode) -> Zeroizing<Vec<u8>> {
        match mode {
            IdentityMode::Complete => identity.serialize(),
            IdentityMode::Public => {
                let mut buf = Zeroizing::new(Vec::with_capacity(2 + 32));
                buf.push(RECORD_VERSION);
                buf.push(MODE_PUBLIC);
                buf.extend_from_slice(&identity.public_key().to_bytes());
                buf
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != RECORD_VERSION {
            return Err(CryptoError::DecodeError(format!(
                "unsupported identity version {version}"
            )));
        }
        let identity = match reader.read_u8()? {
            MODE_COMPLETE => {
                let secret = Zeroizing::new(reader.read_array::<32>()?);
                let public = reader.read_array::<32>()?;
                let pair = IdentityKeyPair::from_secret_bytes(&secret);
                if pair.public_key().to_bytes() != public {
                    return Err(CryptoError::DecodeError(
                        "identity secret does not match its public key".into(),
                    ));
                }
                Self::Complete(pair)
            }
            MODE_PUBLIC => Self::Public(IdentityPublicKey::from_bytes(&reader.read_array()?)?),
            other => {
                return Err(CryptoError::DecodeError(format!(
                    "unknown identity mode {other}"
                )))
            }
        };
        reader.finish()?;
        Ok(identity)
    }
}
