//! One Double Ratchet session: the root chain, all known sending and
//! receiving chains, index bookkeeping, and the pending-pre-key marker kept
//! until the initiator's first decrypt succeeds.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::error::{RatchetError, Result};
use crate::primitives::{KeyPair, PrivateKey, PublicKey};
use crate::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKeyType {
    Ours,
    Theirs,
}

/// `counter` is signed and starts at -1 so the first derived key lands at
/// counter 0. `key` absent marks the chain closed: no further keys
/// derivable, though already-produced `message_keys` remain usable.
#[derive(Debug, Clone)]
pub struct ChainKey {
    pub counter: i64,
    pub key: Option<[u8; 32]>,
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        if let Some(ref mut k) = self.key {
            k.zeroize();
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageKeys(pub HashMap<u32, [u8; 32]>);

impl Drop for MessageKeys {
    fn drop(&mut self) {
        for (_, k) in self.0.iter_mut() {
            k.zeroize();
        }
    }
}

#[derive(Debug)]
pub struct Chain {
    pub chain_key: ChainKey,
    pub chain_type: ChainType,
    pub message_keys: MessageKeys,
}

pub struct CurrentRatchet {
    pub ephemeral_key_pair: KeyPair,
    pub last_remote_ephemeral_key: PublicKey,
    pub previous_counter: u32,
    pub root_key: [u8; 32],
}

impl Drop for CurrentRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub base_key: PublicKey,
    pub base_key_type: BaseKeyType,
    pub remote_identity_key: PublicKey,
    pub created: i64,
    pub used: i64,
    /// `-1` while open; the closure timestamp otherwise.
    pub closed: i64,
}

#[derive(Debug, Clone)]
pub struct PendingPreKey {
    pub signed_key_id: u32,
    pub base_key: PublicKey,
    pub pre_key_id: Option<u32>,
}

pub struct SessionEntry {
    pub registration_id: u32,
    pub current_ratchet: CurrentRatchet,
    pub index_info: IndexInfo,
    pub chains: HashMap<[u8; 33], Chain>,
    pub pending_pre_key: Option<PendingPreKey>,
}

impl SessionEntry {
    pub fn add_chain(&mut self, key: PublicKey, chain: Chain) -> Result<()> {
        if self.chains.contains_key(key.as_bytes()) {
            return Err(RatchetError::session("add_chain: chain already exists for this key"));
        }
        self.chains.insert(*key.as_bytes(), chain);
        Ok(())
    }

    pub fn get_chain(&self, key: &PublicKey) -> Option<&Chain> {
        self.chains.get(key.as_bytes())
    }

    pub fn get_chain_mut(&mut self, key: &PublicKey) -> Option<&mut Chain> {
        self.chains.get_mut(key.as_bytes())
    }

    pub fn delete_chain(&mut self, key: &PublicKey) -> Result<()> {
        self.chains
            .remove(key.as_bytes())
            .map(|_| ())
            .ok_or_else(|| RatchetError::session("delete_chain: no such chain"))
    }

    pub fn chains(&self) -> impl Iterator<Item = (&[u8; 33], &Chain)> {
        self.chains.iter()
    }

    /// Tree of primitive values; all byte fields base64, chains keyed by
    /// base64(ephemeral pub). `chain_key.key` may be `null`. `pending_pre_key`
    /// is present only when set.
    pub fn serialize(&self) -> Value {
        let chains: serde_json::Map<String, Value> = self
            .chains
            .iter()
            .map(|(pub_key, chain)| {
                let key = URL_SAFE_NO_PAD.encode(pub_key);
                let value = json!({
                    "chain_key": {
                        "counter": chain.chain_key.counter,
                        "key": chain.chain_key.key.map(|k| URL_SAFE_NO_PAD.encode(k)),
                    },
                    "chain_type": match chain.chain_type {
                        ChainType::Sending => "SENDING",
                        ChainType::Receiving => "RECEIVING",
                    },
                    "message_keys": chain.message_keys.0.iter()
                        .map(|(counter, key)| (counter.to_string(), URL_SAFE_NO_PAD.encode(key)))
                        .collect::<serde_json::Map<String, Value>>(),
                });
                (key, value)
            })
            .collect();

        let mut entry = json!({
            "registration_id": self.registration_id,
            "current_ratchet": {
                "ephemeral_key_pair": {
                    "pub": URL_SAFE_NO_PAD.encode(self.current_ratchet.ephemeral_key_pair.public.as_bytes()),
                    "priv": URL_SAFE_NO_PAD.encode(self.current_ratchet.ephemeral_key_pair.private.as_bytes()),
                },
                "last_remote_ephemeral_key": URL_SAFE_NO_PAD.encode(self.current_ratchet.last_remote_ephemeral_key.as_bytes()),
                "previous_counter": self.current_ratchet.previous_counter,
                "root_key": URL_SAFE_NO_PAD.encode(self.current_ratchet.root_key),
            },
            "index_info": {
                "base_key": URL_SAFE_NO_PAD.encode(self.index_info.base_key.as_bytes()),
                "base_key_type": match self.index_info.base_key_type {
                    BaseKeyType::Ours => "OURS",
                    BaseKeyType::Theirs => "THEIRS",
                },
                "remote_identity_key": URL_SAFE_NO_PAD.encode(self.index_info.remote_identity_key.as_bytes()),
                "created": self.index_info.created,
                "used": self.index_info.used,
                "closed": self.index_info.closed,
            },
            "chains": chains,
        });

        if let Some(ppk) = &self.pending_pre_key {
            entry["pending_pre_key"] = json!({
                "signed_key_id": ppk.signed_key_id,
                "base_key": URL_SAFE_NO_PAD.encode(ppk.base_key.as_bytes()),
                "pre_key_id": ppk.pre_key_id,
            });
        }

        entry
    }

    pub fn deserialize(data: &Value) -> Result<Self> {
        let registration_id = data
            .get("registration_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| RatchetError::session("SessionEntry: missing registration_id"))? as u32;

        let cr = data
            .get("current_ratchet")
            .ok_or_else(|| RatchetError::session("SessionEntry: missing current_ratchet"))?;
        let ekp = cr
            .get("ephemeral_key_pair")
            .ok_or_else(|| RatchetError::session("current_ratchet: missing ephemeral_key_pair"))?;
        let ephemeral_pub = decode_public_key(ekp, "pub")?;
        let ephemeral_priv = decode_field_len::<32>(ekp, "priv")?;
        let current_ratchet = CurrentRatchet {
            ephemeral_key_pair: KeyPair {
                public: ephemeral_pub,
                private: PrivateKey::from_bytes(ephemeral_priv),
            },
            last_remote_ephemeral_key: decode_public_key(cr, "last_remote_ephemeral_key")?,
            previous_counter: cr.get("previous_counter").and_then(Value::as_u64).unwrap_or(0) as u32,
            root_key: decode_field_len::<32>(cr, "root_key")?,
        };

        let ii = data
            .get("index_info")
            .ok_or_else(|| RatchetError::session("SessionEntry: missing index_info"))?;
        let base_key_type = match ii.get("base_key_type").and_then(Value::as_str) {
            Some("OURS") => BaseKeyType::Ours,
            Some("THEIRS") => BaseKeyType::Theirs,
            _ => return Err(RatchetError::session("index_info: bad base_key_type")),
        };
        let index_info = IndexInfo {
            base_key: decode_public_key(ii, "base_key")?,
            base_key_type,
            remote_identity_key: decode_public_key(ii, "remote_identity_key")?,
            created: ii.get("created").and_then(Value::as_i64).unwrap_or_else(now_millis),
            used: ii.get("used").and_then(Value::as_i64).unwrap_or_else(now_millis),
            closed: ii.get("closed").and_then(Value::as_i64).unwrap_or(-1),
        };

        let mut chains = HashMap::new();
        if let Some(chains_obj) = data.get("chains").and_then(Value::as_object) {
            for (key_b64, chain_val) in chains_obj {
                let key_bytes = URL_SAFE_NO_PAD
                    .decode(key_b64)
                    .map_err(|_| RatchetError::session("chains: bad base64 key"))?;
                let key: [u8; 33] = key_bytes
                    .try_into()
                    .map_err(|_| RatchetError::session("chains: key must be 33 bytes"))?;

                let ck = chain_val
                    .get("chain_key")
                    .ok_or_else(|| RatchetError::session("chain: missing chain_key"))?;
                let counter = ck
                    .get("counter")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RatchetError::session("chain_key: missing counter"))?;
                let key_opt = match ck.get("key") {
                    Some(Value::Null) | None => None,
                    Some(Value::String(s)) => {
                        let bytes = URL_SAFE_NO_PAD
                            .decode(s)
                            .map_err(|_| RatchetError::session("chain_key.key: bad base64"))?;
                        Some(bytes.try_into().map_err(|_| RatchetError::session("chain_key.key: expected 32 bytes"))?)
                    }
                    _ => return Err(RatchetError::session("chain_key.key: bad type")),
                };

                let chain_type = match chain_val.get("chain_type").and_then(Value::as_str) {
                    Some("SENDING") => ChainType::Sending,
                    Some("RECEIVING") => ChainType::Receiving,
                    _ => return Err(RatchetError::session("chain: bad chain_type")),
                };

                let mut message_keys = HashMap::new();
                if let Some(mk_obj) = chain_val.get("message_keys").and_then(Value::as_object) {
                    for (counter_str, key_val) in mk_obj {
                        let counter: u32 = counter_str
                            .parse()
                            .map_err(|_| RatchetError::session("message_keys: bad counter"))?;
                        let key_b64 = key_val
                            .as_str()
                            .ok_or_else(|| RatchetError::session("message_keys: bad value"))?;
                        let bytes = URL_SAFE_NO_PAD
                            .decode(key_b64)
                            .map_err(|_| RatchetError::session("message_keys: bad base64"))?;
                        let arr: [u8; 32] = bytes
                            .try_into()
                            .map_err(|_| RatchetError::session("message_keys: expected 32 bytes"))?;
                        message_keys.insert(counter, arr);
                    }
                }

                chains.insert(
                    key,
                    Chain {
                        chain_key: ChainKey { counter, key: key_opt },
                        chain_type,
                        message_keys: MessageKeys(message_keys),
                    },
                );
            }
        }

        let pending_pre_key = match data.get("pending_pre_key") {
            None | Some(Value::Null) => None,
            Some(ppk) => Some(PendingPreKey {
                signed_key_id: ppk
                    .get("signed_key_id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RatchetError::session("pending_pre_key: missing signed_key_id"))?
                    as u32,
                base_key: decode_public_key(ppk, "base_key")?,
                pre_key_id: ppk.get("pre_key_id").and_then(Value::as_u64).map(|v| v as u32),
            }),
        };

        Ok(SessionEntry {
            registration_id,
            current_ratchet,
            index_info,
            chains,
            pending_pre_key,
        })
    }
}

fn decode_field_len<const N: usize>(obj: &Value, field: &'static str) -> Result<[u8; N]> {
    let s = obj
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RatchetError::session(format!("missing field `{field}`")))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| RatchetError::session(format!("field `{field}`: bad base64")))?;
    bytes
        .try_into()
        .map_err(|_| RatchetError::session(format!("field `{field}`: expected {N} bytes")))
}

fn decode_public_key(obj: &Value, field: &'static str) -> Result<PublicKey> {
    let raw: [u8; 33] = decode_field_len::<33>(obj, field)?;
    PublicKey::from_prefixed(&raw)
}
