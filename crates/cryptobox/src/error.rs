use thiserror::Error;

use crate::ratchet::PreKeyId;

/// Failures of the key store and the ratchet engine.
///
/// Every variant maps onto one stable numeric code (see [`CryptoError::code`]),
/// which is what foreign bindings hand to their callers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("remote identity changed")]
    RemoteIdentityChanged,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("message too distant in the future")]
    TooDistantFuture,

    #[error("outdated message")]
    OutdatedMessage,

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("identity error: {0}")]
    IdentityError(String),

    #[error("prekey not found: {0}")]
    PreKeyNotFound(PreKeyId),

    #[error("degenerated key: {0}")]
    DegeneratedKey(String),

    #[error("internal invariant violated: {0}")]
    Panic(String),

    #[error("crypto initialisation failed: {0}")]
    InitError(String),

    #[error("invalid string: {0}")]
    InvalidString(String),
}

impl CryptoError {
    /// Numeric code of this error kind. Codes 12 and 0 are unused.
    pub fn code(&self) -> u8 {
        match self {
            Self::StorageError(_) => 1,
            Self::SessionNotFound(_) => 2,
            Self::DecodeError(_) => 3,
            Self::RemoteIdentityChanged => 4,
            Self::InvalidSignature => 5,
            Self::InvalidMessage(_) => 6,
            Self::DuplicateMessage => 7,
            Self::TooDistantFuture => 8,
            Self::OutdatedMessage => 9,
            Self::InvalidString(_) => 10,
            Self::IdentityError(_) => 13,
            Self::PreKeyNotFound(_) => 14,
            Self::Panic(_) => 15,
            Self::InitError(_) => 16,
            Self::DegeneratedKey(_) => 17,
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageError(_) | Self::InitError(_) | Self::DegeneratedKey(_)
        )
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageError(e.to_string())
    }
}

/// Error returned by [`CryptoBox`](crate::CryptoBox) and
/// [`CryptoSession`](crate::CryptoSession) handles.
///
/// Use after close is a contract violation of the caller and is kept apart
/// from the protocol errors.
#[derive(Debug, Error)]
pub enum BoxError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid operation on a closed box")]
    BoxClosed,

    #[error("invalid operation on a closed session")]
    SessionClosed,
}

impl BoxError {
    /// The protocol error, if this is not a used-after-close condition.
    pub fn crypto(&self) -> Option<&CryptoError> {
        match self {
            Self::Crypto(e) => Some(e),
            Self::BoxClosed | Self::SessionClosed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::BoxClosed | Self::SessionClosed)
    }
}
