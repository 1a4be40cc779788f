//! ratchet_wire — protobuf-wire-compatible framing for the two ciphertext
//! message shapes the Double Ratchet engine emits: `WhisperMessage` (the
//! steady-state envelope) and `PreKeySignalMessage` (the first message of
//! a handshake, wrapping a `WhisperMessage`).
//!
//! Field numbers mirror the public `WhisperTextProtocol.proto` layout so
//! the wire bytes are a genuine protobuf subset, not an ad hoc TLV scheme.
//! There is no `prost`/`protoc` build step: the schema is four fields and
//! two messages, small enough to encode and decode by hand (see `varint`).

pub mod prekey_signal_message;
pub mod varint;
pub mod whisper_message;

pub use prekey_signal_message::PreKeySignalMessage;
pub use whisper_message::WhisperMessage;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of buffer")]
    Truncated,

    #[error("varint longer than 64 bits")]
    VarintTooLong,

    #[error("unknown protobuf wire type {0}")]
    UnknownWireType(u64),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` could not fit its expected size")]
    FieldSize(&'static str),
}
