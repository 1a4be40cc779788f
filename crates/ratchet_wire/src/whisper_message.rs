//! `WhisperMessage` — the steady-state ratchet envelope.
//!
//! Field layout (protobuf field numbers, wire-type implied by the field
//! type): 1 `ephemeral_key` bytes, 2 `counter` varint, 3
//! `previous_counter` varint, 4 `ciphertext` bytes.

use bytes::BytesMut;

use crate::varint::{decode_bytes, decode_tag, decode_varint, encode_bytes_field, encode_varint_field, skip_field};
use crate::WireError;

const FIELD_EPHEMERAL_KEY: u32 = 1;
const FIELD_COUNTER: u32 = 2;
const FIELD_PREVIOUS_COUNTER: u32 = 3;
const FIELD_CIPHERTEXT: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhisperMessage {
    /// Sender's current DH ratchet public key, 33 bytes (0x05-prefixed).
    pub ephemeral_key: Vec<u8>,
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
}

impl WhisperMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_bytes_field(&mut buf, FIELD_EPHEMERAL_KEY, &self.ephemeral_key);
        encode_varint_field(&mut buf, FIELD_COUNTER, self.counter as u64);
        encode_varint_field(&mut buf, FIELD_PREVIOUS_COUNTER, self.previous_counter as u64);
        encode_bytes_field(&mut buf, FIELD_CIPHERTEXT, &self.ciphertext);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, WireError> {
        use bytes::Buf;

        let mut ephemeral_key = None;
        let mut counter = None;
        let mut previous_counter = None;
        let mut ciphertext = None;

        while data.has_remaining() {
            let (field_number, wire_type) = decode_tag(&mut data)?;
            match field_number {
                FIELD_EPHEMERAL_KEY => ephemeral_key = Some(decode_bytes(&mut data)?),
                FIELD_COUNTER => counter = Some(decode_varint(&mut data)? as u32),
                FIELD_PREVIOUS_COUNTER => previous_counter = Some(decode_varint(&mut data)? as u32),
                FIELD_CIPHERTEXT => ciphertext = Some(decode_bytes(&mut data)?),
                _ => skip_field(&mut data, wire_type)?,
            }
        }

        Ok(WhisperMessage {
            ephemeral_key: ephemeral_key.ok_or(WireError::MissingField("ephemeral_key"))?,
            counter: counter.ok_or(WireError::MissingField("counter"))?,
            previous_counter: previous_counter.ok_or(WireError::MissingField("previous_counter"))?,
            ciphertext: ciphertext.ok_or(WireError::MissingField("ciphertext"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let msg = WhisperMessage {
            ephemeral_key: vec![0x05; 33],
            counter: 7,
            previous_counter: 3,
            ciphertext: b"hello world".to_vec(),
        };
        let encoded = msg.encode();
        let decoded = WhisperMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn missing_field_errors() {
        // Only encode the ephemeral key field; everything else required.
        let mut buf = BytesMut::new();
        encode_bytes_field(&mut buf, FIELD_EPHEMERAL_KEY, &[1, 2, 3]);
        let err = WhisperMessage::decode(&buf).unwrap_err();
        assert!(matches!(err, WireError::MissingField("counter")));
    }

    #[test]
    fn unknown_field_is_skipped() {
        let mut buf = BytesMut::new();
        encode_bytes_field(&mut buf, FIELD_EPHEMERAL_KEY, &[1, 2, 3]);
        encode_varint_field(&mut buf, FIELD_COUNTER, 1);
        encode_varint_field(&mut buf, FIELD_PREVIOUS_COUNTER, 0);
        encode_bytes_field(&mut buf, FIELD_CIPHERTEXT, b"ct");
        encode_varint_field(&mut buf, 99, 42); // forward-compat field
        let decoded = WhisperMessage::decode(&buf).unwrap();
        assert_eq!(decoded.counter, 1);
    }
}
