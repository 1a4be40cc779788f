//! Error taxonomy shared by the session engine.
//!
//! `SessionError` and its siblings are non-retryable: they all indicate the
//! session state cannot absorb the attempted operation as-is, not that the
//! caller should back off and try again. `MessageCounterError` and
//! `PreKeyError` are distinguished because a caller may want to special-case
//! them (duplicate delivery, and "go fetch fresh pre-keys" respectively).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("untrusted identity key for {addr_id}")]
    UntrustedIdentityKey { addr_id: String },

    #[error("session error: {0}")]
    SessionError(String),

    #[error("message counter error: {0}")]
    MessageCounterError(String),

    #[error("pre-key error: {0}")]
    PreKeyError(String),

    #[error("MAC verification failed")]
    BadMac,

    #[error("MAC length mismatch: expected {expected}, got {actual}")]
    BadMacLength { expected: usize, actual: usize },

    #[error("incompatible protocol version (byte {0:#04x})")]
    IncompatibleVersion(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("wire codec error: {0}")]
    Wire(#[from] ratchet_wire::WireError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RatchetError {
    pub fn session(msg: impl Into<String>) -> Self {
        RatchetError::SessionError(msg.into())
    }

    pub fn pre_key(msg: impl Into<String>) -> Self {
        RatchetError::PreKeyError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RatchetError>;
