//! The handshake: `init_outgoing` seeds a session from a peer's
//! pre-key bundle (X3DH-lite, initiator side); `init_incoming` seeds one
//! from a received `PreKeySignalMessage` (responder side). Both funnel
//! through `init_session`, the mixed-DH derivation common to both roles.

use std::collections::HashMap;
use std::sync::Arc;

use zeroize::Zeroize;

use crate::address::ProtocolAddress;
use crate::config::RatchetConfig;
use crate::error::{RatchetError, Result};
use crate::primitives::{hkdf, x25519_agree, x25519_keypair, xeddsa_verify, KeyPair, PublicKey};
use crate::queue::PeerQueue;
use crate::session_entry::{
    BaseKeyType, Chain, ChainKey, ChainType, CurrentRatchet, IndexInfo, MessageKeys, PendingPreKey, SessionEntry,
};
use crate::session_record::SessionRecord;
use crate::storage::Storage;
use crate::time::now_millis;

/// Published in advance by a peer so sessions can be initiated
/// asynchronously (X3DH pattern).
pub struct PreKeyBundle {
    pub identity_key: PublicKey,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyEntry,
    pub pre_key: Option<OneTimePreKeyEntry>,
}

pub struct SignedPreKeyEntry {
    pub key_id: u32,
    pub public_key: PublicKey,
    pub signature: [u8; 64],
}

pub struct OneTimePreKeyEntry {
    pub key_id: u32,
    pub public_key: PublicKey,
}

/// Parsed, handshake-relevant contents of an inbound `PreKeySignalMessage`
/// (the wire envelope itself is decoded by the cipher before this is built).
pub struct IncomingPreKey {
    pub registration_id: u32,
    pub identity_key: PublicKey,
    pub base_key: PublicKey,
    pub signed_pre_key_id: u32,
    pub pre_key_id: Option<u32>,
}

pub struct SessionBuilder {
    storage: Arc<dyn Storage>,
    queue: Arc<PeerQueue>,
    address: ProtocolAddress,
    config: RatchetConfig,
}

impl SessionBuilder {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<PeerQueue>, address: ProtocolAddress, config: RatchetConfig) -> Self {
        SessionBuilder {
            storage,
            queue,
            address,
            config,
        }
    }

    /// Initiator path (X3DH-lite). Verifies the bundle's signed pre-key
    /// signature, generates a fresh ephemeral base key, derives the initial
    /// root key, and persists the resulting session as the record's open
    /// session.
    pub async fn init_outgoing(&self, bundle: &PreKeyBundle) -> Result<()> {
        let bucket = self.address.to_encoded();
        let storage = self.storage.clone();
        let config = self.config;
        let addr = self.address.clone();
        let bundle_identity = bundle.identity_key;
        let bundle_registration_id = bundle.registration_id;
        let bundle_signed_key_id = bundle.signed_pre_key.key_id;
        let bundle_signed_pub = bundle.signed_pre_key.public_key;
        let bundle_signature = bundle.signed_pre_key.signature;
        let bundle_pre_key = bundle.pre_key.as_ref().map(|p| (p.key_id, p.public_key));

        self.queue
            .run_exclusive(&bucket, config.gc_limit, || async move {
                if !storage.is_trusted_identity(addr.id(), &bundle_identity).await? {
                    return Err(RatchetError::UntrustedIdentityKey {
                        addr_id: addr.id().to_string(),
                    });
                }

                if config.verify_signed_prekey_signature
                    && !xeddsa_verify(&bundle_identity, &bundle_signed_pub.raw(), &bundle_signature)
                {
                    return Err(RatchetError::session("init_outgoing: signed pre-key signature verification failed"));
                }

                let our_identity = storage.get_our_identity().await?;
                let registration_id = storage.get_our_registration_id().await?;
                let base_key = x25519_keypair();
                let base_key_pub = base_key.public;

                let mut session = init_session(
                    true,
                    &our_identity,
                    Some(&base_key),
                    None,
                    &bundle_identity,
                    bundle_pre_key.as_ref().map(|(_, pk)| pk),
                    Some(&bundle_signed_pub),
                    bundle_registration_id,
                    config,
                )?;
                session.registration_id = registration_id;
                session.pending_pre_key = Some(PendingPreKey {
                    signed_key_id: bundle_signed_key_id,
                    base_key: base_key_pub,
                    pre_key_id: bundle_pre_key.map(|(id, _)| id),
                });

                let mut record = storage.load_session(&addr.to_encoded()).await?.unwrap_or_default();
                if let Some(open) = record.get_open_session() {
                    let open_base_key = open.index_info.base_key;
                    record.close_session(&open_base_key)?;
                }
                record.set_session(session);
                record.remove_old_sessions(config.closed_sessions_max);
                storage.store_session(&addr.to_encoded(), &record).await?;
                Ok(())
            })
            .await
    }

    /// Responder path. Returns the one-time pre-key id consumed, if any,
    /// for the caller to delete after decryption succeeds.
    pub async fn init_incoming(&self, record: &mut SessionRecord, message: &IncomingPreKey) -> Result<Option<u32>> {
        if !self.storage.is_trusted_identity(self.address.id(), &message.identity_key).await? {
            return Err(RatchetError::UntrustedIdentityKey {
                addr_id: self.address.id().to_string(),
            });
        }

        if record.get_session(&message.base_key)?.is_some() {
            // Already processed this handshake; nothing to do.
            return Ok(None);
        }

        let pre_key_pair = if let Some(id) = message.pre_key_id {
            Some(
                self.storage
                    .load_pre_key(id)
                    .await?
                    .ok_or_else(|| RatchetError::pre_key(format!("one-time pre-key {id} not found")))?,
            )
        } else {
            None
        };

        let signed_pre_key_pair = self
            .storage
            .load_signed_pre_key(message.signed_pre_key_id)
            .await?
            .ok_or_else(|| RatchetError::pre_key(format!("signed pre-key {} not found", message.signed_pre_key_id)))?;

        if let Some(open) = record.get_open_session() {
            let open_base_key = open.index_info.base_key;
            record.close_session(&open_base_key)?;
        }

        let our_identity = self.storage.get_our_identity().await?;
        let session = init_session(
            false,
            &our_identity,
            pre_key_pair.as_ref(),
            Some(&signed_pre_key_pair),
            &message.identity_key,
            Some(&message.base_key),
            None,
            message.registration_id,
            self.config,
        )?;
        record.set_session(session);
        record.remove_old_sessions(self.config.closed_sessions_max);

        Ok(message.pre_key_id)
    }
}

/// The mixed-DH derivation shared by both handshake roles.
#[allow(clippy::too_many_arguments)]
fn init_session(
    is_initiator: bool,
    our_identity: &KeyPair,
    our_ephemeral: Option<&KeyPair>,
    mut our_signed: Option<&KeyPair>,
    their_identity: &PublicKey,
    their_ephemeral: Option<&PublicKey>,
    mut their_signed: Option<&PublicKey>,
    registration_id: u32,
    config: RatchetConfig,
) -> Result<SessionEntry> {
    if is_initiator {
        if our_signed.is_some() {
            return Err(RatchetError::InvalidArgument(
                "init_session: initiator must not supply our_signed".into(),
            ));
        }
        our_signed = our_ephemeral;
    } else {
        if their_signed.is_some() {
            return Err(RatchetError::InvalidArgument(
                "init_session: responder must not supply their_signed".into(),
            ));
        }
        their_signed = their_ephemeral;
    }

    let our_signed = our_signed.ok_or_else(|| RatchetError::InvalidArgument("init_session: our_signed required".into()))?;
    let their_signed_pub = *their_signed.ok_or_else(|| RatchetError::InvalidArgument("init_session: their_signed required".into()))?;

    let mut a1 = x25519_agree(&their_signed_pub, &our_identity.private);
    let mut a2 = x25519_agree(their_identity, &our_signed.private);
    let mut a3 = x25519_agree(&their_signed_pub, &our_signed.private);
    let mut a4 = match (our_ephemeral, their_ephemeral) {
        (Some(our_eph), Some(their_eph)) => Some(x25519_agree(their_eph, &our_eph.private)),
        _ => None,
    };

    let (x1, x2) = if is_initiator { (a1, a2) } else { (a2, a1) };

    let mut shared_secret = Vec::with_capacity(32 + 32 + 32 + 32 + 32);
    shared_secret.extend_from_slice(&[0xffu8; 32]);
    shared_secret.extend_from_slice(&x1);
    shared_secret.extend_from_slice(&x2);
    shared_secret.extend_from_slice(&a3);
    if let Some(a4_bytes) = a4.as_ref() {
        shared_secret.extend_from_slice(a4_bytes);
    }

    let master = hkdf(&shared_secret, &[0u8; 32], b"WhisperText", 2)?;
    shared_secret.zeroize();
    a1.zeroize();
    a2.zeroize();
    a3.zeroize();
    if let Some(a4_bytes) = a4.as_mut() {
        a4_bytes.zeroize();
    }

    let ephemeral_key_pair = if is_initiator { x25519_keypair() } else { our_signed.clone() };
    let now = now_millis();

    let mut session = SessionEntry {
        registration_id,
        current_ratchet: CurrentRatchet {
            ephemeral_key_pair,
            last_remote_ephemeral_key: their_signed_pub,
            previous_counter: 0,
            root_key: master[0],
        },
        index_info: IndexInfo {
            base_key: if is_initiator {
                our_ephemeral.expect("initiator always supplies our_ephemeral").public
            } else {
                *their_ephemeral.expect("responder always supplies their_ephemeral")
            },
            base_key_type: if is_initiator { BaseKeyType::Ours } else { BaseKeyType::Theirs },
            remote_identity_key: *their_identity,
            created: now,
            used: now,
            closed: -1,
        },
        chains: HashMap::new(),
        pending_pre_key: None,
    };

    if is_initiator {
        calculate_sending_ratchet(&mut session, &their_signed_pub, config)?;
    }

    Ok(session)
}

/// Seeds the first sending chain for a freshly built session.
pub(crate) fn calculate_sending_ratchet(session: &mut SessionEntry, remote_key: &PublicKey, _config: RatchetConfig) -> Result<()> {
    let mut s = x25519_agree(remote_key, &session.current_ratchet.ephemeral_key_pair.private);
    let m = hkdf(&s, &session.current_ratchet.root_key, b"WhisperRatchet", 2)?;
    s.zeroize();

    let sending_key = session.current_ratchet.ephemeral_key_pair.public;
    session.add_chain(
        sending_key,
        Chain {
            chain_key: ChainKey {
                counter: -1,
                key: Some(m[1]),
            },
            chain_type: ChainType::Sending,
            message_keys: MessageKeys::default(),
        },
    )?;
    session.current_ratchet.root_key = m[0];
    Ok(())
}
