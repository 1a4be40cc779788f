//! Encrypt/decrypt, the DH ratchet step, chain fill, and MAC
//! construction/verification. The largest single component: this is the
//! Double Ratchet itself, framed to/from the wire types in `ratchet_wire`.

use std::sync::Arc;

use ratchet_wire::{PreKeySignalMessage, WhisperMessage};
use zeroize::Zeroize;

use crate::address::ProtocolAddress;
use crate::builder::{IncomingPreKey, SessionBuilder};
use crate::config::RatchetConfig;
use crate::error::{RatchetError, Result};
use crate::primitives::{aes_cbc_decrypt, aes_cbc_encrypt, hkdf, hmac, x25519_agree, x25519_keypair, PublicKey};
use crate::queue::PeerQueue;
use crate::session_entry::{Chain, ChainKey, ChainType, MessageKeys, SessionEntry};
use crate::session_record::SessionRecord;
use crate::storage::Storage;
use crate::time::now_millis;

const MESSAGE_TYPE_WHISPER: u8 = 1;
const MESSAGE_TYPE_PREKEY: u8 = 3;

fn version_byte(version: u8) -> u8 {
    (version << 4) | version
}

fn check_version(byte: u8, version: u8) -> Result<()> {
    let high = byte >> 4;
    let low = byte & 0x0f;
    if high >= version && low <= version {
        Ok(())
    } else {
        Err(RatchetError::IncompatibleVersion(byte))
    }
}

/// Result of a successful `encrypt` call.
pub struct EncryptedMessage {
    pub message_type: u8,
    pub body: Vec<u8>,
    pub registration_id: u32,
}

pub struct SessionCipher {
    storage: Arc<dyn Storage>,
    queue: Arc<PeerQueue>,
    address: ProtocolAddress,
    config: RatchetConfig,
}

impl SessionCipher {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<PeerQueue>, address: ProtocolAddress, config: RatchetConfig) -> Self {
        SessionCipher {
            storage,
            queue,
            address,
            config,
        }
    }

    pub async fn encrypt(&self, data: &[u8]) -> Result<EncryptedMessage> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let addr = self.address.clone();
        let config = self.config;
        let data = data.to_vec();

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                let mut record = storage
                    .load_session(&addr.to_encoded())
                    .await?
                    .ok_or_else(|| RatchetError::session("encrypt: no sessions for this peer"))?;

                let session = record
                    .get_open_session_mut()
                    .ok_or_else(|| RatchetError::session("encrypt: no open session"))?;

                if !storage
                    .is_trusted_identity(addr.id(), &session.index_info.remote_identity_key)
                    .await?
                {
                    return Err(RatchetError::UntrustedIdentityKey {
                        addr_id: addr.id().to_string(),
                    });
                }

                let sending_key = session.current_ratchet.ephemeral_key_pair.public;
                let chain = session
                    .get_chain_mut(&sending_key)
                    .ok_or_else(|| RatchetError::session("encrypt: no sending chain for current ratchet"))?;
                if chain.chain_type != ChainType::Sending {
                    return Err(RatchetError::session("encrypt: chain for current ratchet is not SENDING"));
                }

                let next_counter = chain.chain_key.counter + 1;
                fill_message_keys(chain, next_counter, config)?;
                let mut message_key = chain
                    .message_keys
                    .0
                    .remove(&(next_counter as u32))
                    .ok_or_else(|| RatchetError::session("encrypt: message key missing after fill"))?;

                let mut keys = hkdf(&message_key, &[0u8; 32], b"WhisperMessageKeys", 3)?;
                message_key.zeroize();
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&keys[2][..16]);

                let ciphertext = aes_cbc_encrypt(&keys[0], &data, &iv);
                let whisper = WhisperMessage {
                    ephemeral_key: sending_key.as_bytes().to_vec(),
                    counter: next_counter as u32,
                    previous_counter: session.current_ratchet.previous_counter,
                    ciphertext,
                };
                let wire_bytes = whisper.encode();

                let our_identity = storage.get_our_identity().await?;
                let mut mac_input = Vec::with_capacity(33 + 33 + 1 + wire_bytes.len());
                mac_input.extend_from_slice(our_identity.public.as_bytes());
                mac_input.extend_from_slice(session.index_info.remote_identity_key.as_bytes());
                mac_input.push(version_byte(config.version));
                mac_input.extend_from_slice(&wire_bytes);
                let mac = hmac(&keys[1], &mac_input);
                mac_input.zeroize();
                keys.iter_mut().for_each(|k| k.zeroize());

                let mut envelope = Vec::with_capacity(1 + wire_bytes.len() + 8);
                envelope.push(version_byte(config.version));
                envelope.extend_from_slice(&wire_bytes);
                envelope.extend_from_slice(&mac[..8]);

                let registration_id = storage.get_our_registration_id().await?;
                let (message_type, body) = if let Some(pending) = &session.pending_pre_key {
                    let pre_key_msg = PreKeySignalMessage {
                        registration_id,
                        pre_key_id: pending.pre_key_id,
                        signed_pre_key_id: pending.signed_key_id,
                        base_key: pending.base_key.as_bytes().to_vec(),
                        identity_key: our_identity.public.as_bytes().to_vec(),
                        message: envelope,
                    };
                    let mut body = Vec::new();
                    body.push(version_byte(config.version));
                    body.extend_from_slice(&pre_key_msg.encode());
                    (MESSAGE_TYPE_PREKEY, body)
                } else {
                    (MESSAGE_TYPE_WHISPER, envelope)
                };

                storage.store_session(&addr.to_encoded(), &record).await?;

                Ok(EncryptedMessage {
                    message_type,
                    body,
                    registration_id,
                })
            })
            .await
    }

    pub async fn decrypt_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let addr = self.address.clone();
        let config = self.config;
        let data = data.to_vec();

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                let mut record = storage
                    .load_session(&addr.to_encoded())
                    .await?
                    .ok_or_else(|| RatchetError::session("decrypt_whisper_message: no sessions for this peer"))?;

                let our_identity = storage.get_our_identity().await?;
                let (base_key, plaintext) = decrypt_with_sessions(&mut record, &data, &our_identity.public, config)?;

                let session = record
                    .session_mut(&base_key)
                    .expect("decrypt_with_sessions returned a key present in the record");

                if !storage
                    .is_trusted_identity(addr.id(), &session.index_info.remote_identity_key)
                    .await?
                {
                    return Err(RatchetError::UntrustedIdentityKey {
                        addr_id: addr.id().to_string(),
                    });
                }

                if record.is_closed(&base_key)? {
                    tracing::warn!(addr = %addr, "decrypt_whisper_message: decrypted on a closed session");
                }

                storage.store_session(&addr.to_encoded(), &record).await?;
                Ok(plaintext)
            })
            .await
    }

    pub async fn decrypt_pre_key_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let queue = self.queue.clone();
        let addr = self.address.clone();
        let config = self.config;
        let data = data.to_vec();

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                if data.is_empty() {
                    return Err(RatchetError::session("decrypt_pre_key_whisper_message: empty body"));
                }
                check_version(data[0], config.version)?;
                let pre_key_wire = PreKeySignalMessage::decode(&data[1..])?;

                let identity_key = PublicKey::from_prefixed(&pre_key_wire.identity_key)?;
                let base_key = PublicKey::from_prefixed(&pre_key_wire.base_key)?;

                let mut record = match storage.load_session(&addr.to_encoded()).await? {
                    Some(record) => record,
                    None => SessionRecord::new(),
                };

                let incoming = IncomingPreKey {
                    registration_id: pre_key_wire.registration_id,
                    identity_key,
                    base_key,
                    signed_pre_key_id: pre_key_wire.signed_pre_key_id,
                    pre_key_id: pre_key_wire.pre_key_id,
                };

                let builder = SessionBuilder::new(storage.clone(), queue, addr.clone(), config);
                let consumed_pre_key_id = builder.init_incoming(&mut record, &incoming).await?;

                let session = record
                    .session_mut(&base_key)
                    .ok_or_else(|| RatchetError::session("decrypt_pre_key_whisper_message: session missing after handshake"))?;

                let our_identity = storage.get_our_identity().await?;
                let plaintext = do_decrypt(&pre_key_wire.message, session, &our_identity.public, config)?;

                storage.store_session(&addr.to_encoded(), &record).await?;
                if let Some(id) = consumed_pre_key_id {
                    storage.remove_pre_key(id).await?;
                }
                Ok(plaintext)
            })
            .await
    }

    pub async fn has_open_session(&self) -> Result<bool> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let addr = self.address.clone();
        let config = self.config;

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                let record = storage.load_session(&addr.to_encoded()).await?;
                Ok(record.map(|r| r.get_open_session().is_some()).unwrap_or(false))
            })
            .await
    }

    pub async fn close_open_session(&self) -> Result<()> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let addr = self.address.clone();
        let config = self.config;

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                let mut record = match storage.load_session(&addr.to_encoded()).await? {
                    Some(record) => record,
                    None => return Ok(()),
                };
                if let Some(open) = record.get_open_session() {
                    let base_key = open.index_info.base_key;
                    record.close_session(&base_key)?;
                    storage.store_session(&addr.to_encoded(), &record).await?;
                }
                Ok(())
            })
            .await
    }
}

/// Trial-decrypt over every stored session in `used`-descending order.
/// Authentication failures on individual candidates are absorbed; only
/// total failure is surfaced, as the coarse `SessionError` the design notes
/// call out (no per-session error detail is leaked to the caller).
fn decrypt_with_sessions(
    record: &mut SessionRecord,
    data: &[u8],
    our_identity_pub: &PublicKey,
    config: RatchetConfig,
) -> Result<(PublicKey, Vec<u8>)> {
    let candidates = record.ordered_base_keys();
    if candidates.is_empty() {
        return Err(RatchetError::session("decrypt_with_sessions: no matching sessions"));
    }

    let mut last_err = None;
    for base_key in &candidates {
        let session = record.session_mut(base_key).expect("key came from this record");
        match do_decrypt(data, session, our_identity_pub, config) {
            Ok(plaintext) => {
                session.index_info.used = now_millis();
                return Ok((*base_key, plaintext));
            }
            Err(e) => last_err = Some(e),
        }
    }

    if candidates.len() == 1 {
        // Single-candidate records surface the specific failure: there is
        // no ambiguity about which session rejected the message.
        return Err(last_err.unwrap_or_else(|| RatchetError::session("decrypt_with_sessions: no matching sessions")));
    }

    tracing::debug!(attempts = candidates.len(), "decrypt_with_sessions: no matching sessions");
    Err(RatchetError::session("No matching sessions"))
}

fn do_decrypt(message_bytes: &[u8], session: &mut SessionEntry, our_identity_pub: &PublicKey, config: RatchetConfig) -> Result<Vec<u8>> {
    if message_bytes.len() < 9 {
        return Err(RatchetError::session("do_decrypt: message too short"));
    }
    check_version(message_bytes[0], config.version)?;

    let len = message_bytes.len();
    let wire_bytes = &message_bytes[1..len - 8];
    let received_mac = &message_bytes[len - 8..];

    let whisper = WhisperMessage::decode(wire_bytes)?;
    let remote_ephemeral = PublicKey::from_prefixed(&whisper.ephemeral_key)?;

    maybe_step_ratchet(session, &remote_ephemeral, whisper.previous_counter, config)?;

    let chain = session
        .get_chain_mut(&remote_ephemeral)
        .ok_or_else(|| RatchetError::session("do_decrypt: no chain for remote ephemeral"))?;
    if chain.chain_type != ChainType::Receiving {
        return Err(RatchetError::session("do_decrypt: chain for remote ephemeral is not RECEIVING"));
    }

    fill_message_keys(chain, whisper.counter as i64, config)?;
    let mut message_key = chain
        .message_keys
        .0
        .remove(&whisper.counter)
        .ok_or_else(|| RatchetError::MessageCounterError("Key used already or never filled".into()))?;

    let mut keys = hkdf(&message_key, &[0u8; 32], b"WhisperMessageKeys", 3)?;
    message_key.zeroize();

    let mut mac_input = Vec::with_capacity(33 + 33 + 1 + wire_bytes.len());
    mac_input.extend_from_slice(session.index_info.remote_identity_key.as_bytes());
    mac_input.extend_from_slice(our_identity_pub.as_bytes());
    mac_input.push(message_bytes[0]);
    mac_input.extend_from_slice(wire_bytes);

    let verify_result = crate::primitives::verify_mac(&mac_input, &keys[1], received_mac, 8);
    mac_input.zeroize();

    if let Err(e) = verify_result {
        keys.iter_mut().for_each(|k| k.zeroize());
        return Err(e);
    }

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&keys[2][..16]);
    let plaintext = aes_cbc_decrypt(&keys[0], &whisper.ciphertext, &iv);
    keys.iter_mut().for_each(|k| k.zeroize());
    let plaintext = plaintext?;

    session.pending_pre_key = None;
    Ok(plaintext)
}

fn fill_message_keys(chain: &mut Chain, until_counter: i64, config: RatchetConfig) -> Result<()> {
    while chain.chain_key.counter < until_counter {
        if until_counter - chain.chain_key.counter > config.max_message_keys_gap as i64 {
            return Err(RatchetError::session("Over 2000 messages into the future!"));
        }
        let Some(current_key) = chain.chain_key.key else {
            return Err(RatchetError::session("Chain closed"));
        };
        let next_counter = chain.chain_key.counter + 1;
        let message_key = hmac(&current_key, &[0x01]);
        let mut next_chain_key = hmac(&current_key, &[0x02]);
        chain.message_keys.0.insert(next_counter as u32, message_key);
        chain.chain_key.key = Some(next_chain_key);
        next_chain_key.zeroize();
        chain.chain_key.counter = next_counter;
    }
    Ok(())
}

fn maybe_step_ratchet(session: &mut SessionEntry, remote_ephemeral: &PublicKey, their_previous_counter: u32, config: RatchetConfig) -> Result<()> {
    if session.get_chain(remote_ephemeral).is_some() {
        return Ok(());
    }

    let last_remote = session.current_ratchet.last_remote_ephemeral_key;
    if let Some(prev_recv_chain) = session.get_chain_mut(&last_remote) {
        fill_message_keys(prev_recv_chain, their_previous_counter as i64, config)?;
        if let Some(mut old_key) = prev_recv_chain.chain_key.key.take() {
            old_key.zeroize();
        }
    }

    calculate_ratchet(session, remote_ephemeral, ChainType::Receiving)?;

    let prev_sending_key = session.current_ratchet.ephemeral_key_pair.public;
    if let Some(prev_send) = session.get_chain(&prev_sending_key) {
        session.current_ratchet.previous_counter = prev_send.chain_key.counter.max(0) as u32;
        session.delete_chain(&prev_sending_key)?;
    }

    session.current_ratchet.ephemeral_key_pair = x25519_keypair();
    calculate_ratchet(session, remote_ephemeral, ChainType::Sending)?;
    session.current_ratchet.last_remote_ephemeral_key = *remote_ephemeral;

    Ok(())
}

fn calculate_ratchet(session: &mut SessionEntry, remote_key: &PublicKey, chain_type: ChainType) -> Result<()> {
    let mut s = x25519_agree(remote_key, &session.current_ratchet.ephemeral_key_pair.private);
    let m = hkdf(&s, &session.current_ratchet.root_key, b"WhisperRatchet", 2)?;
    s.zeroize();

    let chain_key = if chain_type == ChainType::Sending {
        session.current_ratchet.ephemeral_key_pair.public
    } else {
        *remote_key
    };
    session.add_chain(
        chain_key,
        Chain {
            chain_key: ChainKey {
                counter: -1,
                key: Some(m[1]),
            },
            chain_type,
            message_keys: MessageKeys::default(),
        },
    )?;
    session.current_ratchet.root_key = m[0];
    Ok(())
}
