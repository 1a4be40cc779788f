//! ratchet_core — the Double Ratchet session engine and the X3DH-derived
//! handshake that seeds it: asynchronous, forward-secret, post-compromise-
//! secure pairwise messaging between two `(id, device_id)` endpoints.
//!
//! Persistence is out of scope; the engine consumes it through the
//! [`Storage`] capability. Wire framing lives in the sibling `ratchet_wire`
//! crate and is re-exported here for convenience.

pub mod address;
pub mod builder;
pub mod cipher;
pub mod config;
pub mod error;
pub mod primitives;
pub mod queue;
pub mod session_entry;
pub mod session_record;
pub mod storage;
mod time;

pub use address::ProtocolAddress;
pub use builder::{IncomingPreKey, OneTimePreKeyEntry, PreKeyBundle, SessionBuilder, SignedPreKeyEntry};
pub use cipher::{EncryptedMessage, SessionCipher};
pub use config::RatchetConfig;
pub use error::{RatchetError, Result};
pub use queue::PeerQueue;
pub use session_entry::SessionEntry;
pub use session_record::SessionRecord;
pub use storage::Storage;

pub use ratchet_wire::{PreKeySignalMessage, WhisperMessage, WireError};
