//! Double ratchet state of a single handshake.
//!
//! The initiator ("Alice") starts with one receive chain towards the
//! responder's prekey and immediately performs a sending DH step. The
//! responder ("Bob") starts with a sending chain on his prekey and learns
//! his first receive chain from Alice's first message.

use std::collections::VecDeque;

use x25519_dalek::PublicKey;

use crate::config::BoxConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::ratchet::kdf::{derive_secrets, ChainKey, MessageKeys, RootKey};
use crate::ratchet::keys::{agree, KeyPair, PreKeyBundle};
use crate::ratchet::message::{CipherMessage, Envelope, SessionTag};
use crate::ratchet::reader::Reader;

#[derive(Clone)]
struct RecvChain {
    chain_key: ChainKey,
    ratchet_key: PublicKey,
    /// Counters below this had their keys evicted.
    outdated_below: u32,
    /// Keys of skipped messages, ascending by counter.
    message_keys: VecDeque<MessageKeys>,
}

#[derive(Clone)]
struct SendChain {
    chain_key: ChainKey,
    ratchet_key: KeyPair,
}

#[derive(Clone)]
pub(crate) struct SessionState {
    recv_chains: VecDeque<RecvChain>,
    /// Ratchet keys of receive chains dropped from `recv_chains`, newest first.
    retired_ratchet_keys: VecDeque<PublicKey>,
    send_chain: SendChain,
    root_key: RootKey,
    prev_counter: u32,
}

impl RecvChain {
    fn new(chain_key: ChainKey, ratchet_key: PublicKey) -> Self {
        Self {
            chain_key,
            ratchet_key,
            outdated_below: 0,
            message_keys: VecDeque::new(),
        }
    }

    /// Decrypt a message older than the chain head from the retained keys.
    fn try_message_keys(&mut self, message: &CipherMessage, header: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.counter < self.outdated_below {
            return Err(CryptoError::OutdatedMessage);
        }
        let pos = self
            .message_keys
            .iter()
            .position(|keys| keys.counter == message.counter)
            .ok_or(CryptoError::DuplicateMessage)?;
        let plaintext = self.message_keys[pos].decrypt(&message.ciphertext, header)?;
        self.message_keys.remove(pos);
        Ok(plaintext)
    }

    /// Derive the keys of every message between the chain head and `counter`.
    fn stage_message_keys(
        &self,
        counter: u32,
        config: &BoxConfig,
    ) -> Result<(ChainKey, Vec<MessageKeys>), CryptoError> {
        let gap = counter - self.chain_key.idx();
        if gap > config.max_counter_gap {
            return Err(CryptoError::TooDistantFuture);
        }
        let mut chain_key = self.chain_key.clone();
        let mut staged = Vec::with_capacity(gap as usize);
        while chain_key.idx() < counter {
            staged.push(chain_key.message_keys()?);
            chain_key = chain_key.next()?;
        }
        Ok((chain_key, staged))
    }

    fn commit_message_keys(&mut self, staged: Vec<MessageKeys>, config: &BoxConfig) {
        self.message_keys.extend(staged);
        let limit = config.max_counter_gap as usize;
        while self.message_keys.len() > limit {
            if let Some(evicted) = self.message_keys.pop_front() {
                self.outdated_below = evicted.counter.saturating_add(1);
            }
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), CryptoError> {
        buf.extend_from_slice(self.chain_key.as_bytes());
        buf.extend_from_slice(&self.chain_key.idx().to_be_bytes());
        buf.extend_from_slice(self.ratchet_key.as_bytes());
        buf.extend_from_slice(&self.outdated_below.to_be_bytes());
        let count = u32::try_from(self.message_keys.len())
            .map_err(|_| CryptoError::Panic("too many retained message keys".into()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        buf.reserve(self.message_keys.len() * MessageKeys::ENCODED_LEN);
        for keys in &self.message_keys {
            keys.encode_into(buf);
        }
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CryptoError> {
        let key = reader.read_array()?;
        let idx = reader.read_u32()?;
        let ratchet_key = PublicKey::from(reader.read_array::<32>()?);
        let outdated_below = reader.read_u32()?;
        let count = reader.read_u32()? as usize;
        let mut message_keys = VecDeque::new();
        for _ in 0..count {
            message_keys.push_back(MessageKeys::decode(reader)?);
        }
        Ok(Self {
            chain_key: ChainKey::new(key, idx),
            ratchet_key,
            outdated_below,
            message_keys,
        })
    }
}

fn master_secret(parts: [&[u8; 32]; 3]) -> zeroize::Zeroizing<Vec<u8>> {
    let mut master = zeroize::Zeroizing::new(Vec::with_capacity(96));
    for part in parts {
        master.extend_from_slice(part);
    }
    master
}

impl SessionState {
    /// Initiator side of X3DH against a peer's prekey bundle.
    pub fn init_as_alice(
        identity: &IdentityKeyPair,
        base_key: &KeyPair,
        bob: &PreKeyBundle,
    ) -> Result<Self, CryptoError> {
        let dh1 = agree(&identity.to_x25519_secret(), &bob.public_key)?;
        let dh2 = base_key.dh(&bob.identity_key.to_x25519())?;
        let dh3 = base_key.dh(&bob.public_key)?;
        let master = master_secret([&*dh1, &*dh2, &*dh3]);
        let (root_key, chain_key) = derive_secrets(&master)?;

        let recv_chain = RecvChain::new(chain_key, bob.public_key);
        let ratchet_key = KeyPair::generate();
        let (root_key, send_key) = root_key.dh_ratchet(&ratchet_key, &bob.public_key)?;

        Ok(Self {
            recv_chains: VecDeque::from([recv_chain]),
            retired_ratchet_keys: VecDeque::new(),
            send_chain: SendChain {
                chain_key: send_key,
                ratchet_key,
            },
            root_key,
            prev_counter: 0,
        })
    }

    /// Responder side of X3DH from the material of a prekey message.
    pub fn init_as_bob(
        identity: &IdentityKeyPair,
        prekey: &KeyPair,
        alice_identity: &IdentityPublicKey,
        alice_base: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let dh1 = prekey.dh(&alice_identity.to_x25519())?;
        let dh2 = agree(&identity.to_x25519_secret(), alice_base)?;
        let dh3 = prekey.dh(alice_base)?;
        let master = master_secret([&*dh1, &*dh2, &*dh3]);
        let (root_key, chain_key) = derive_secrets(&master)?;

        Ok(Self {
            recv_chains: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
            send_chain: SendChain {
                chain_key,
                ratchet_key: prekey.clone(),
            },
            root_key,
            prev_counter: 0,
        })
    }

    /// Adopt the peer's new ratchet key: one receiving and one sending DH step.
    fn ratchet(&mut self, ratchet_key: PublicKey, config: &BoxConfig) -> Result<(), CryptoError> {
        let new_ratchet = KeyPair::generate();
        let (recv_root, recv_chain) = self
            .root_key
            .dh_ratchet(&self.send_chain.ratchet_key, &ratchet_key)?;
        let (send_root, send_chain) = recv_root.dh_ratchet(&new_ratchet, &ratchet_key)?;

        self.recv_chains
            .push_front(RecvChain::new(recv_chain, ratchet_key));
        while self.recv_chains.len() > config.max_recv_chains {
            if let Some(dropped) = self.recv_chains.pop_back() {
                self.retired_ratchet_keys.push_front(dropped.ratchet_key);
            }
        }
        self.retired_ratchet_keys.truncate(config.max_recv_chains);
        self.prev_counter = self.send_chain.chain_key.idx();
        self.root_key = send_root;
        self.send_chain = SendChain {
            chain_key: send_chain,
            ratchet_key: new_ratchet,
        };
        Ok(())
    }

    /// Encrypt with the next sending key. `wrap` chooses the envelope kind;
    /// the AEAD covers its complete header.
    pub fn encrypt(
        &mut self,
        tag: SessionTag,
        plaintext: &[u8],
        wrap: impl FnOnce(CipherMessage) -> Envelope,
    ) -> Result<Envelope, CryptoError> {
        let keys = self.send_chain.chain_key.message_keys()?;
        let next = self.send_chain.chain_key.next()?;

        let mut envelope = wrap(CipherMessage {
            session_tag: tag,
            counter: keys.counter,
            prev_counter: self.prev_counter,
            ratchet_key: *self.send_chain.ratchet_key.public(),
            ciphertext: Vec::new(),
        });
        let header = envelope.encode_header();
        envelope.message_mut().ciphertext = keys.encrypt(plaintext, &header)?;

        self.send_chain.chain_key = next;
        Ok(envelope)
    }

    /// Decrypt in place. The state may be partially advanced on error, so
    /// callers run this on a copy.
    pub fn decrypt(&mut self, envelope: &Envelope, config: &BoxConfig) -> Result<Vec<u8>, CryptoError> {
        let message = envelope.message();
        let header = envelope.encode_header();

        let idx = match self
            .recv_chains
            .iter()
            .position(|chain| chain.ratchet_key == message.ratchet_key)
        {
            Some(idx) => idx,
            None if self.retired_ratchet_keys.contains(&message.ratchet_key) => {
                return Err(CryptoError::OutdatedMessage);
            }
            None => {
                self.ratchet(message.ratchet_key, config).map_err(|e| match e {
                    CryptoError::DegeneratedKey(msg) => CryptoError::InvalidMessage(msg),
                    other => other,
                })?;
                0
            }
        };
        let chain = &mut self.recv_chains[idx];
        let head = chain.chain_key.idx();

        if message.counter < head {
            chain.try_message_keys(message, &header)
        } else if message.counter == head {
            let keys = chain.chain_key.message_keys()?;
            let plaintext = keys.decrypt(&message.ciphertext, &header)?;
            chain.chain_key = chain.chain_key.next()?;
            Ok(plaintext)
        } else {
            let (chain_key, staged) = chain.stage_message_keys(message.counter, config)?;
            let keys = chain_key.message_keys()?;
            let plaintext = keys.decrypt(&message.ciphertext, &header)?;
            chain.commit_message_keys(staged, config);
            chain.chain_key = chain_key.next()?;
            Ok(plaintext)
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), CryptoError> {
        buf.extend_from_slice(self.root_key.as_bytes());
        buf.extend_from_slice(&self.prev_counter.to_be_bytes());
        buf.extend_from_slice(self.send_chain.chain_key.as_bytes());
        buf.extend_from_slice(&self.send_chain.chain_key.idx().to_be_bytes());
        buf.extend_from_slice(self.send_chain.ratchet_key.secret_bytes().as_ref());
        let count = u16::try_from(self.recv_chains.len())
            .map_err(|_| CryptoError::Panic("too many receive chains".into()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for chain in &self.recv_chains {
            chain.encode_into(buf)?;
        }
        let retired = u16::try_from(self.retired_ratchet_keys.len())
            .map_err(|_| CryptoError::Panic("too many retired ratchet keys".into()))?;
        buf.extend_from_slice(&retired.to_be_bytes());
        for key in &self.retired_ratchet_keys {
            buf.extend_from_slice(key.as_bytes());
        }
        Ok(())
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CryptoError> {
        let root_key = RootKey::from_bytes(reader.read_array()?);
        let prev_counter = reader.read_u32()?;
        let send_key = reader.read_array()?;
        let send_idx = reader.read_u32()?;
        let ratchet_key = KeyPair::from_secret_bytes(reader.read_array()?);
        let count = reader.read_u16()?;
        let mut recv_chains = VecDeque::with_capacity(count.into());
        for _ in 0..count {
            recv_chains.push_back(RecvChain::decode(reader)?);
        }
        let retired = reader.read_u16()?;
        let mut retired_ratchet_keys = VecDeque::with_capacity(retired.into());
        for _ in 0..retired {
            retired_ratchet_keys.push_back(PublicKey::from(reader.read_array::<32>()?));
        }
        Ok(Self {
            recv_chains,
            retired_ratchet_keys,
            send_chain: SendChain {
                chain_key: ChainKey::new(send_key, send_idx),
                ratchet_key,
            },
            root_key,
            prev_counter,
        })
    }
}
