//! End-to-end scenarios and the testable properties against a two-party
//! in-memory exchange (Alice initiates, Bob responds).

use std::sync::Arc;

use rand::RngCore;

use ratchet_core::builder::{OneTimePreKeyEntry, PreKeyBundle, SignedPreKeyEntry};
use ratchet_core::primitives::{x25519_keypair, xeddsa_sign};
use ratchet_core::storage::testing::InMemoryStorage;
use ratchet_core::storage::Storage;
use ratchet_core::{PeerQueue, ProtocolAddress, RatchetConfig, RatchetError, SessionBuilder, SessionCipher};

struct Party {
    storage: Arc<InMemoryStorage>,
    queue: Arc<PeerQueue>,
    peer_addr: ProtocolAddress,
    config: RatchetConfig,
}

impl Party {
    fn new(registration_id: u32, peer_addr: ProtocolAddress) -> Self {
        Party {
            storage: Arc::new(InMemoryStorage::generate(registration_id)),
            queue: Arc::new(PeerQueue::new()),
            peer_addr,
            config: RatchetConfig::default(),
        }
    }

    fn storage_dyn(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    fn builder(&self) -> SessionBuilder {
        SessionBuilder::new(self.storage_dyn(), self.queue.clone(), self.peer_addr.clone(), self.config)
    }

    fn cipher(&self) -> SessionCipher {
        SessionCipher::new(self.storage_dyn(), self.queue.clone(), self.peer_addr.clone(), self.config)
    }
}

fn random_64() -> [u8; 64] {
    let mut buf = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Publishes a signed pre-key (and optionally a one-time pre-key) for
/// `bob` and returns the bundle Alice would fetch from a server.
async fn publish_bundle(bob: &Party, signed_key_id: u32, one_time_key_id: Option<u32>) -> PreKeyBundle {
    let identity = bob.storage.get_our_identity().await.unwrap();
    let registration_id = bob.storage.get_our_registration_id().await.unwrap();

    let signed_pair = x25519_keypair();
    let signature = xeddsa_sign(identity.private.as_bytes(), &signed_pair.public.raw(), &random_64());
    bob.storage.insert_signed_pre_key(signed_key_id, signed_pair.clone());

    let pre_key = match one_time_key_id {
        Some(id) => {
            let pair = x25519_keypair();
            bob.storage.insert_pre_key(id, pair.clone());
            Some(OneTimePreKeyEntry { key_id: id, public_key: pair.public })
        }
        None => None,
    };

    PreKeyBundle {
        identity_key: identity.public,
        registration_id,
        signed_pre_key: SignedPreKeyEntry {
            key_id: signed_key_id,
            public_key: signed_pair.public,
            signature,
        },
        pre_key,
    }
}

fn setup() -> (Party, Party) {
    let bob_addr = ProtocolAddress::new("bob", 1).unwrap();
    let alice_addr = ProtocolAddress::new("alice", 1).unwrap();
    let alice = Party::new(5001, bob_addr);
    let bob = Party::new(5002, alice_addr);
    (alice, bob)
}

#[tokio::test]
async fn s1_handshake_then_first_message() {
    let (alice, bob) = setup();
    let bundle = publish_bundle(&bob, 42, Some(7)).await;

    alice.builder().init_outgoing(&bundle).await.unwrap();
    let sent = alice.cipher().encrypt(b"hi").await.unwrap();
    assert_eq!(sent.message_type, 3);

    let plaintext = bob.cipher().decrypt_pre_key_whisper_message(&sent.body).await.unwrap();
    assert_eq!(plaintext, b"hi");
    assert!(bob.storage.load_pre_key(7).await.unwrap().is_none());
}

#[tokio::test]
async fn s2_reply_clears_pending_pre_key() {
    let (alice, bob) = setup();
    let bundle = publish_bundle(&bob, 42, Some(7)).await;
    alice.builder().init_outgoing(&bundle).await.unwrap();
    let first = alice.cipher().encrypt(b"hi").await.unwrap();
    bob.cipher().decrypt_pre_key_whisper_message(&first.body).await.unwrap();

    let reply = bob.cipher().encrypt(b"hey").await.unwrap();
    assert_eq!(reply.message_type, 1);

    let plaintext = alice.cipher().decrypt_whisper_message(&reply.body).await.unwrap();
    assert_eq!(plaintext, b"hey");

    let record = alice.storage.load_session(&alice.peer_addr.to_encoded()).await.unwrap().unwrap();
    let open = record.get_open_session().unwrap();
    assert!(open.pending_pre_key.is_none());
}

async fn established_pair() -> (Party, Party) {
    let (alice, bob) = setup();
    let bundle = publish_bundle(&bob, 42, Some(7)).await;
    alice.builder().init_outgoing(&bundle).await.unwrap();
    let first = alice.cipher().encrypt(b"hi").await.unwrap();
    bob.cipher().decrypt_pre_key_whisper_message(&first.body).await.unwrap();
    let reply = bob.cipher().encrypt(b"hey").await.unwrap();
    alice.cipher().decrypt_whisper_message(&reply.body).await.unwrap();
    (alice, bob)
}

#[tokio::test]
async fn s3_out_of_order_delivery() {
    let (alice, bob) = established_pair().await;

    let mut messages = Vec::new();
    for i in 0..5 {
        let m = alice.cipher().encrypt(format!("m{i}").as_bytes()).await.unwrap();
        messages.push(m.body);
    }

    for idx in [2, 0, 4, 1, 3] {
        let plaintext = bob.cipher().decrypt_whisper_message(&messages[idx]).await.unwrap();
        assert_eq!(plaintext, format!("m{idx}").as_bytes());
    }

    let err = bob.cipher().decrypt_whisper_message(&messages[2]).await.unwrap_err();
    assert!(matches!(err, RatchetError::MessageCounterError(_)));
}

#[tokio::test]
async fn s4_future_overflow_then_recovery() {
    let (alice, bob) = established_pair().await;

    let mut messages = Vec::new();
    for i in 0..2002 {
        let m = alice.cipher().encrypt(format!("m{i}").as_bytes()).await.unwrap();
        messages.push(m.body);
    }

    let err = bob.cipher().decrypt_whisper_message(&messages[2001]).await.unwrap_err();
    assert!(matches!(err, RatchetError::SessionError(_)));

    for idx in 0..2001 {
        bob.cipher().decrypt_whisper_message(&messages[idx]).await.unwrap();
    }
    bob.cipher().decrypt_whisper_message(&messages[2001]).await.unwrap();
}

#[tokio::test]
async fn s5_trust_revocation_checked_after_decrypt() {
    let (alice, bob) = established_pair().await;
    let sent = alice.cipher().encrypt(b"still here").await.unwrap();

    bob.storage.set_trusted(bob.peer_addr.id(), false);
    let err = bob.cipher().decrypt_whisper_message(&sent.body).await.unwrap_err();
    assert!(matches!(err, RatchetError::UntrustedIdentityKey { .. }));
}

#[tokio::test]
async fn s6_retention_keeps_forty_most_recently_closed() {
    let (alice, bob) = setup();

    for i in 0..60u32 {
        let bundle = publish_bundle(&bob, 100 + i, None).await;
        alice.builder().init_outgoing(&bundle).await.unwrap();
        let sent = alice.cipher().encrypt(b"hi").await.unwrap();
        bob.cipher().decrypt_pre_key_whisper_message(&sent.body).await.unwrap();
    }

    let record = alice.storage.load_session(&alice.peer_addr.to_encoded()).await.unwrap().unwrap();
    assert_eq!(record.serialize()["_sessions"].as_object().unwrap().len(), 40);
}

#[tokio::test]
async fn s6_retention_prunes_responder_side_too() {
    let (alice, bob) = setup();

    for i in 0..60u32 {
        let bundle = publish_bundle(&bob, 100 + i, None).await;
        alice.builder().init_outgoing(&bundle).await.unwrap();
        let sent = alice.cipher().encrypt(b"hi").await.unwrap();
        bob.cipher().decrypt_pre_key_whisper_message(&sent.body).await.unwrap();
    }

    let record = bob.storage.load_session(&bob.peer_addr.to_encoded()).await.unwrap().unwrap();
    assert_eq!(record.serialize()["_sessions"].as_object().unwrap().len(), 40);
}

#[tokio::test]
async fn forward_secrecy_allows_reverse_order_decrypt() {
    let (alice, bob) = established_pair().await;

    let mut messages = Vec::new();
    for i in 0..5 {
        let m = alice.cipher().encrypt(format!("m{i}").as_bytes()).await.unwrap();
        messages.push(m.body);
    }
    for idx in (0..5).rev() {
        let plaintext = bob.cipher().decrypt_whisper_message(&messages[idx]).await.unwrap();
        assert_eq!(plaintext, format!("m{idx}").as_bytes());
    }
}

#[tokio::test]
async fn dh_ratchet_steps_on_each_reply() {
    let (alice, bob) = established_pair().await;

    let record_before = alice.storage.load_session(&alice.peer_addr.to_encoded()).await.unwrap().unwrap();
    let ephemeral_before = record_before.get_open_session().unwrap().current_ratchet.ephemeral_key_pair.public;

    let reply = bob.cipher().encrypt(b"another reply").await.unwrap();
    alice.cipher().decrypt_whisper_message(&reply.body).await.unwrap();

    let record_after = alice.storage.load_session(&alice.peer_addr.to_encoded()).await.unwrap().unwrap();
    let session_after = record_after.get_open_session().unwrap();
    assert_ne!(session_after.current_ratchet.ephemeral_key_pair.public, ephemeral_before);
    assert!(session_after.get_chain(&ephemeral_before).is_none());
}

#[tokio::test]
async fn trust_gate_blocks_init_outgoing_without_mutating_storage() {
    let (alice, bob) = setup();
    let bundle = publish_bundle(&bob, 42, Some(7)).await;
    alice.storage.set_trusted(alice.peer_addr.id(), false);

    let err = alice.builder().init_outgoing(&bundle).await.unwrap_err();
    assert!(matches!(err, RatchetError::UntrustedIdentityKey { .. }));
    assert!(alice.storage.load_session(&alice.peer_addr.to_encoded()).await.unwrap().is_none());
}

#[tokio::test]
async fn retained_prekey_handshake_is_idempotent() {
    let (alice, bob) = setup();
    let bundle = publish_bundle(&bob, 42, Some(7)).await;
    alice.builder().init_outgoing(&bundle).await.unwrap();
    let sent = alice.cipher().encrypt(b"hi").await.unwrap();

    let first = bob.cipher().decrypt_pre_key_whisper_message(&sent.body).await.unwrap();
    assert_eq!(first, b"hi");
    assert!(bob.storage.load_pre_key(7).await.unwrap().is_none());

    // A second delivery of the very same PreKeySignalMessage reuses the
    // already-established session (the handshake is a no-op the second
    // time) but the message counter was already consumed: a duplicate
    // delivery, reported as such rather than decrypted again.
    let err = bob.cipher().decrypt_pre_key_whisper_message(&sent.body).await.unwrap_err();
    assert!(matches!(err, RatchetError::MessageCounterError(_)));
}

#[tokio::test]
async fn migration_backfills_registration_id_from_top_level() {
    let data = serde_json::json!({
        "_sessions": {},
        "registration_id": 1234,
    });
    let record = ratchet_core::SessionRecord::deserialize(&data).unwrap();
    assert!(record.get_open_session().is_none());
}
