//! The collection of `SessionEntry`s kept per peer: open/closed
//! lifecycle, bounded retention of closed sessions, and the used-descending
//! order that drives trial decryption.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::error::{RatchetError, Result};
use crate::primitives::PublicKey;
use crate::session_entry::{BaseKeyType, SessionEntry};
use crate::time::now_millis;

pub const SESSION_RECORD_VERSION: &str = "v1";

pub struct SessionRecord {
    sessions: IndexMap<[u8; 33], SessionEntry>,
    version: String,
}

impl Default for SessionRecord {
    fn default() -> Self {
        SessionRecord {
            sessions: IndexMap::new(),
            version: SESSION_RECORD_VERSION.to_string(),
        }
    }
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver must never decrypt with their own base key.
    pub fn get_session(&self, base_key: &PublicKey) -> Result<Option<&SessionEntry>> {
        match self.sessions.get(base_key.as_bytes()) {
            None => Ok(None),
            Some(s) if s.index_info.base_key_type == BaseKeyType::Ours => Err(RatchetError::TypeMismatch(
                "get_session: refusing to return a session keyed by our own base key".into(),
            )),
            Some(s) => Ok(Some(s)),
        }
    }

    /// Ordered keys for trial decryption, `used` descending. Pair with
    /// `session_mut` to mutate the chosen candidate in place.
    pub fn ordered_base_keys(&self) -> Vec<PublicKey> {
        self.get_sessions().into_iter().map(|s| s.index_info.base_key).collect()
    }

    /// Unlike `get_session`, does not reject a session keyed by our own
    /// base key — used by trial decryption, which iterates every stored
    /// session regardless of who generated its base key.
    pub fn session_mut(&mut self, base_key: &PublicKey) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(base_key.as_bytes())
    }

    pub fn get_open_session(&self) -> Option<&SessionEntry> {
        self.sessions.values().find(|s| s.index_info.closed == -1)
    }

    pub fn get_open_session_mut(&mut self) -> Option<&mut SessionEntry> {
        self.sessions.values_mut().find(|s| s.index_info.closed == -1)
    }

    pub fn set_session(&mut self, session: SessionEntry) {
        let key = *session.index_info.base_key.as_bytes();
        self.sessions.insert(key, session);
    }

    /// Ordered by `used` descending — defines the trial-decrypt sequence.
    pub fn get_sessions(&self) -> Vec<&SessionEntry> {
        let mut out: Vec<&SessionEntry> = self.sessions.values().collect();
        out.sort_by(|a, b| b.index_info.used.cmp(&a.index_info.used));
        out
    }

    pub fn close_session(&mut self, base_key: &PublicKey) -> Result<()> {
        let session = self
            .sessions
            .get_mut(base_key.as_bytes())
            .ok_or_else(|| RatchetError::session("close_session: no such session"))?;
        if session.index_info.closed != -1 {
            tracing::warn!(base_key = %URL_SAFE_NO_PAD.encode(base_key.as_bytes()), "close_session: already closed");
        } else {
            session.index_info.closed = now_millis();
        }
        Ok(())
    }

    pub fn open_session(&mut self, base_key: &PublicKey) -> Result<()> {
        let session = self
            .sessions
            .get_mut(base_key.as_bytes())
            .ok_or_else(|| RatchetError::session("open_session: no such session"))?;
        session.index_info.closed = -1;
        Ok(())
    }

    pub fn is_closed(&self, base_key: &PublicKey) -> Result<bool> {
        self.sessions
            .get(base_key.as_bytes())
            .map(|s| s.index_info.closed != -1)
            .ok_or_else(|| RatchetError::session("is_closed: no such session"))
    }

    /// While the session count exceeds `max`, evict the CLOSED session with
    /// the smallest `closed` timestamp. If count exceeds `max` but no
    /// session is closed, do not evict — warn only. Open sessions are never
    /// evicted.
    pub fn remove_old_sessions(&mut self, max: usize) {
        while self.sessions.len() > max {
            let oldest_closed_key = self
                .sessions
                .iter()
                .filter(|(_, s)| s.index_info.closed != -1)
                .min_by_key(|(_, s)| s.index_info.closed)
                .map(|(k, _)| *k);

            match oldest_closed_key {
                Some(key) => {
                    self.sessions.shift_remove(&key);
                }
                None => {
                    tracing::warn!(
                        count = self.sessions.len(),
                        max,
                        "remove_old_sessions: over limit but no closed session to evict"
                    );
                    break;
                }
            }
        }
    }

    pub fn serialize(&self) -> Value {
        let sessions: serde_json::Map<String, Value> = self
            .sessions
            .iter()
            .map(|(key, entry)| (URL_SAFE_NO_PAD.encode(key), entry.serialize()))
            .collect();
        json!({
            "_sessions": sessions,
            "version": self.version,
        })
    }

    pub fn deserialize(data: &Value) -> Result<Self> {
        let version = data.get("version").and_then(Value::as_str);
        let needs_v1_migration = !matches!(version, Some(SESSION_RECORD_VERSION));

        let top_level_registration_id = data.get("registration_id").and_then(Value::as_u64);

        let sessions_obj = data
            .get("_sessions")
            .and_then(Value::as_object)
            .ok_or_else(|| RatchetError::session("SessionRecord: missing _sessions"))?;

        let mut sessions = IndexMap::new();
        for (key_b64, entry_val) in sessions_obj {
            let key_bytes = URL_SAFE_NO_PAD
                .decode(key_b64)
                .map_err(|_| RatchetError::session("_sessions: bad base64 key"))?;
            let key: [u8; 33] = key_bytes
                .try_into()
                .map_err(|_| RatchetError::session("_sessions: key must be 33 bytes"))?;

            let mut entry_val = entry_val.clone();
            if needs_v1_migration && entry_val.get("registration_id").is_none() {
                match top_level_registration_id {
                    Some(id) => {
                        entry_val["registration_id"] = json!(id);
                    }
                    None => {
                        let is_open = entry_val
                            .get("index_info")
                            .and_then(|ii| ii.get("closed"))
                            .and_then(Value::as_i64)
                            .map(|closed| closed == -1)
                            .unwrap_or(false);
                        if is_open {
                            tracing::error!(
                                base_key = %key_b64,
                                "v1 migration: open session missing registration_id, defaulting to 0"
                            );
                        }
                        entry_val["registration_id"] = json!(0);
                    }
                }
            }

            sessions.insert(key, SessionEntry::deserialize(&entry_val)?);
        }

        Ok(SessionRecord {
            sessions,
            version: SESSION_RECORD_VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{KeyPair, PrivateKey};
    use crate::session_entry::{ChainKey, ChainType, Chain, CurrentRatchet, IndexInfo, MessageKeys};
    use std::collections::HashMap;

    fn dummy_session(base_key_byte: u8, closed: i64, used: i64) -> SessionEntry {
        let pub_key = PublicKey::from_raw(&[base_key_byte; 32]);
        SessionEntry {
            registration_id: 1,
            current_ratchet: CurrentRatchet {
                ephemeral_key_pair: KeyPair {
                    public: pub_key,
                    private: PrivateKey::from_bytes([1u8; 32]),
                },
                last_remote_ephemeral_key: pub_key,
                previous_counter: 0,
                root_key: [0u8; 32],
            },
            index_info: IndexInfo {
                base_key: pub_key,
                base_key_type: BaseKeyType::Ours,
                remote_identity_key: pub_key,
                created: 0,
                used,
                closed,
            },
            chains: HashMap::new(),
            pending_pre_key: None,
        }
    }

    #[test]
    fn retention_keeps_most_recently_closed() {
        let mut record = SessionRecord::new();
        for i in 0..60u8 {
            record.set_session(dummy_session(i, i as i64, i as i64));
        }
        record.remove_old_sessions(40);
        assert_eq!(record.serialize()["_sessions"].as_object().unwrap().len(), 40);
    }

    #[test]
    fn open_sessions_never_evicted() {
        let mut record = SessionRecord::new();
        record.set_session(dummy_session(1, -1, 100));
        for i in 2..50u8 {
            record.set_session(dummy_session(i, i as i64, i as i64));
        }
        record.remove_old_sessions(40);
        let pub_key = PublicKey::from_raw(&[1u8; 32]);
        assert!(!record.is_closed(&pub_key).unwrap());
    }

    #[test]
    fn sessions_order_by_used_descending() {
        let mut record = SessionRecord::new();
        record.set_session(dummy_session(1, -1, 10));
        record.set_session(dummy_session(2, -1, 30));
        record.set_session(dummy_session(3, -1, 20));
        let used: Vec<i64> = record.get_sessions().iter().map(|s| s.index_info.used).collect();
        assert_eq!(used, vec![30, 20, 10]);
    }
}
