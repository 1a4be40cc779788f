//! Minimal protobuf wire primitives: varints, tags, and length-delimited
//! fields. Hand-written rather than generated — the schema here is four
//! small messages, not worth a build-time `protoc` dependency.

use bytes::{Buf, BufMut};

use crate::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    LengthDelimited,
}

impl WireType {
    fn tag_bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::LengthDelimited => 2,
        }
    }

    fn from_tag_bits(bits: u64) -> Result<Self, WireError> {
        match bits {
            0 => Ok(WireType::Varint),
            2 => Ok(WireType::LengthDelimited),
            other => Err(WireError::UnknownWireType(other)),
        }
    }
}

pub fn encode_tag(buf: &mut impl BufMut, field_number: u32, wire_type: WireType) {
    encode_varint(buf, ((field_number as u64) << 3) | wire_type.tag_bits());
}

pub fn decode_tag(buf: &mut impl Buf) -> Result<(u32, WireType), WireError> {
    let raw = decode_varint(buf)?;
    let wire_type = WireType::from_tag_bits(raw & 0x7);
    let field_number = (raw >> 3) as u32;
    Ok((field_number, wire_type?))
}

pub fn encode_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn decode_varint(buf: &mut impl Buf) -> Result<u64, WireError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        if shift >= 64 {
            return Err(WireError::VarintTooLong);
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

pub fn encode_bytes_field(buf: &mut impl BufMut, field_number: u32, data: &[u8]) {
    encode_tag(buf, field_number, WireType::LengthDelimited);
    encode_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn encode_varint_field(buf: &mut impl BufMut, field_number: u32, value: u64) {
    encode_tag(buf, field_number, WireType::Varint);
    encode_varint(buf, value);
}

/// Read one length-delimited payload, advancing `buf` past it.
pub fn decode_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, WireError> {
    let len = decode_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Skip a field's value given its wire type (used to ignore unknown fields
/// so the codec tolerates forward-compatible additions).
pub fn skip_field(buf: &mut impl Buf, wire_type: WireType) -> Result<(), WireError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(buf)?;
        }
        WireType::LengthDelimited => {
            decode_bytes(buf)?;
        }
    }
    Ok(())
}
