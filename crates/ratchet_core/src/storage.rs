//! The narrow capability set the engine consumes for persistence and
//! trust decisions. The persistence backend itself is out of scope; this
//! crate only defines the trait and, for its own tests, a non-persistent
//! reference implementation (`testing::InMemoryStorage`).

use async_trait::async_trait;

use crate::error::Result;
use crate::primitives::{KeyPair, PublicKey};
use crate::session_record::SessionRecord;

/// All methods are asynchronous, may fail, and never mutate engine state —
/// the engine is the sole mutator of `SessionRecord`s; storage only loads
/// and persists what it's handed.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Our long-term identity key pair. Public half carries the 0x05 prefix.
    async fn get_our_identity(&self) -> Result<KeyPair>;

    /// Our 14-bit registration id (0..16383).
    async fn get_our_registration_id(&self) -> Result<u32>;

    /// TOFU or policy trust check for a peer's identity key.
    async fn is_trusted_identity(&self, id: &str, key: &PublicKey) -> Result<bool>;

    async fn load_session(&self, fq_addr: &str) -> Result<Option<SessionRecord>>;

    /// Atomically persist a (possibly pruned) record.
    async fn store_session(&self, fq_addr: &str, record: &SessionRecord) -> Result<()>;

    async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>>;

    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<KeyPair>>;

    /// Delete a consumed one-time pre-key. Idempotent.
    async fn remove_pre_key(&self, id: u32) -> Result<()>;
}

pub mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Non-persistent `Storage` for exercising the handshake and cipher in
    /// tests. Trust defaults to "trust on first use": any identity key is
    /// trusted until `set_trusted` says otherwise.
    pub struct InMemoryStorage {
        identity: KeyPair,
        registration_id: u32,
        trust_overrides: Mutex<HashMap<String, bool>>,
        sessions: Mutex<HashMap<String, serde_json::Value>>,
        pre_keys: Mutex<HashMap<u32, KeyPair>>,
        signed_pre_keys: Mutex<HashMap<u32, KeyPair>>,
    }

    impl InMemoryStorage {
        pub fn new(identity: KeyPair, registration_id: u32) -> Self {
            InMemoryStorage {
                identity,
                registration_id,
                trust_overrides: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                pre_keys: Mutex::new(HashMap::new()),
                signed_pre_keys: Mutex::new(HashMap::new()),
            }
        }

        pub fn generate(registration_id: u32) -> Self {
            InMemoryStorage::new(crate::primitives::x25519_keypair(), registration_id)
        }

        /// Flip trust for a peer identity, keyed by address id. Used by
        /// tests to exercise the trust-revocation scenario.
        pub fn set_trusted(&self, addr_id: &str, trusted: bool) {
            self.trust_overrides.lock().insert(addr_id.to_string(), trusted);
        }

        pub fn insert_pre_key(&self, id: u32, key: KeyPair) {
            self.pre_keys.lock().insert(id, key);
        }

        pub fn insert_signed_pre_key(&self, id: u32, key: KeyPair) {
            self.signed_pre_keys.lock().insert(id, key);
        }
    }

    #[async_trait]
    impl Storage for InMemoryStorage {
        async fn get_our_identity(&self) -> Result<KeyPair> {
            Ok(self.identity.clone())
        }

        async fn get_our_registration_id(&self) -> Result<u32> {
            Ok(self.registration_id)
        }

        async fn is_trusted_identity(&self, id: &str, _key: &PublicKey) -> Result<bool> {
            Ok(*self.trust_overrides.lock().get(id).unwrap_or(&true))
        }

        async fn load_session(&self, fq_addr: &str) -> Result<Option<SessionRecord>> {
            self.sessions
                .lock()
                .get(fq_addr)
                .map(SessionRecord::deserialize)
                .transpose()
        }

        async fn store_session(&self, fq_addr: &str, record: &SessionRecord) -> Result<()> {
            self.sessions.lock().insert(fq_addr.to_string(), record.serialize());
            Ok(())
        }

        async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>> {
            Ok(self.pre_keys.lock().get(&id).cloned())
        }

        async fn load_signed_pre_key(&self, id: u32) -> Result<Option<KeyPair>> {
            Ok(self.signed_pre_keys.lock().get(&id).cloned())
        }

        async fn remove_pre_key(&self, id: u32) -> Result<()> {
            self.pre_keys.lock().remove(&id);
            Ok(())
        }
    }
}
