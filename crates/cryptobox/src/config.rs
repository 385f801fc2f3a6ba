use serde::Deserialize;

use crate::error::CryptoError;

/// Tunables of a box and the sessions it opens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoxConfig {
    /// Largest forward jump within one receive chain. Also bounds the number
    /// of skipped message keys a chain retains.
    pub max_counter_gap: u32,
    /// Receive chains (earlier ratchet steps) kept per session state.
    pub max_recv_chains: usize,
    /// Session states (one per handshake) kept per session.
    pub max_session_states: usize,
    /// Longest accepted session id, in bytes.
    pub max_session_id_len: usize,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            max_counter_gap: 1000,
            max_recv_chains: 5,
            max_session_states: 100,
            max_session_id_len: 255,
        }
    }
}

impl BoxConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CryptoError::DecodeError(format!("box config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.max_counter_gap == 0 {
            return Err(CryptoError::InvalidString("max_counter_gap must be positive".into()));
        }
        if self.max_recv_chains == 0 {
            return Err(CryptoError::InvalidString("max_recv_chains must be positive".into()));
        }
        if self.max_session_states == 0 {
            return Err(CryptoError::InvalidString(
                "max_session_states must be positive".into(),
            ));
        }
        // Session ids double as file names.
        if self.max_session_id_len == 0 || self.max_session_id_len > 255 {
            return Err(CryptoError::InvalidString(
                "max_session_id_len must be within 1..=255".into(),
            ));
        }
        Ok(())
    }
}
