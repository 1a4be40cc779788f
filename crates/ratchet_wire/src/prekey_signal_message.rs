//! `PreKeySignalMessage` — wraps the first `WhisperMessage` of a session
//! with the X3DH handshake data the responder needs to derive the same
//! root key (spec's `PreKeyWhisperMessage`).
//!
//! Field layout: 1 `pre_key_id` varint (optional — absent when the bundle
//! had no one-time pre-key), 2 `base_key` bytes, 3 `identity_key` bytes,
//! 4 `message` bytes (the embedded `WhisperMessage` envelope), 5
//! `registration_id` varint, 6 `signed_pre_key_id` varint.

use bytes::{Buf, BytesMut};

use crate::varint::{decode_bytes, decode_tag, decode_varint, encode_bytes_field, encode_varint_field, skip_field};
use crate::WireError;

const FIELD_PRE_KEY_ID: u32 = 1;
const FIELD_BASE_KEY: u32 = 2;
const FIELD_IDENTITY_KEY: u32 = 3;
const FIELD_MESSAGE: u32 = 4;
const FIELD_REGISTRATION_ID: u32 = 5;
const FIELD_SIGNED_PRE_KEY_ID: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    /// Initiator's ephemeral base key, 33 bytes (0x05-prefixed).
    pub base_key: Vec<u8>,
    /// Initiator's identity public key, 33 bytes (0x05-prefixed).
    pub identity_key: Vec<u8>,
    /// Embedded `WhisperMessage` envelope bytes.
    pub message: Vec<u8>,
}

impl PreKeySignalMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        if let Some(id) = self.pre_key_id {
            encode_varint_field(&mut buf, FIELD_PRE_KEY_ID, id as u64);
        }
        encode_bytes_field(&mut buf, FIELD_BASE_KEY, &self.base_key);
        encode_bytes_field(&mut buf, FIELD_IDENTITY_KEY, &self.identity_key);
        encode_bytes_field(&mut buf, FIELD_MESSAGE, &self.message);
        encode_varint_field(&mut buf, FIELD_REGISTRATION_ID, self.registration_id as u64);
        encode_varint_field(&mut buf, FIELD_SIGNED_PRE_KEY_ID, self.signed_pre_key_id as u64);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, WireError> {
        let mut pre_key_id = None;
        let mut base_key = None;
        let mut identity_key = None;
        let mut message = None;
        let mut registration_id = None;
        let mut signed_pre_key_id = None;

        while data.has_remaining() {
            let (field_number, wire_type) = decode_tag(&mut data)?;
            match field_number {
                FIELD_PRE_KEY_ID => pre_key_id = Some(decode_varint(&mut data)? as u32),
                FIELD_BASE_KEY => base_key = Some(decode_bytes(&mut data)?),
                FIELD_IDENTITY_KEY => identity_key = Some(decode_bytes(&mut data)?),
                FIELD_MESSAGE => message = Some(decode_bytes(&mut data)?),
                FIELD_REGISTRATION_ID => registration_id = Some(decode_varint(&mut data)? as u32),
                FIELD_SIGNED_PRE_KEY_ID => signed_pre_key_id = Some(decode_varint(&mut data)? as u32),
                _ => skip_field(&mut data, wire_type)?,
            }
        }

        Ok(PreKeySignalMessage {
            registration_id: registration_id.ok_or(WireError::MissingField("registration_id"))?,
            pre_key_id,
            signed_pre_key_id: signed_pre_key_id.ok_or(WireError::MissingField("signed_pre_key_id"))?,
            base_key: base_key.ok_or(WireError::MissingField("base_key"))?,
            identity_key: identity_key.ok_or(WireError::MissingField("identity_key"))?,
            message: message.ok_or(WireError::MissingField("message"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_pre_key() {
        let msg = PreKeySignalMessage {
            registration_id: 1234,
            pre_key_id: Some(7),
            signed_pre_key_id: 1,
            base_key: vec![0x05; 33],
            identity_key: vec![0x05; 33],
            message: b"envelope-bytes".to_vec(),
        };
        let encoded = msg.encode();
        assert_eq!(PreKeySignalMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrip_without_pre_key() {
        let msg = PreKeySignalMessage {
            registration_id: 9,
            pre_key_id: None,
            signed_pre_key_id: 42,
            base_key: vec![0x05; 33],
            identity_key: vec![0x05; 33],
            message: b"envelope-bytes".to_vec(),
        };
        let encoded = msg.encode();
        let decoded = PreKeySignalMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.pre_key_id, None);
        assert_eq!(decoded, msg);
    }
}
