//! `(id, device_id)` protocol address, the per-peer bucket key.

use std::fmt;

use crate::error::{RatchetError, Result};

/// Immutable `(id, device_id)` pair identifying one remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    id: String,
    device_id: u32,
}

impl ProtocolAddress {
    /// `id` must not contain `.`; `device_id` must fit a non-negative,
    /// safe integer (here: any `u32`).
    pub fn new(id: impl Into<String>, device_id: u32) -> Result<Self> {
        let id = id.into();
        if id.contains('.') {
            return Err(RatchetError::InvalidArgument(format!(
                "address id must not contain '.': {id:?}"
            )));
        }
        if id.is_empty() {
            return Err(RatchetError::InvalidArgument("address id must not be empty".into()));
        }
        Ok(ProtocolAddress { id, device_id })
    }

    /// Parse `"{id}.{device_id}"`, splitting on the LAST `.` so ids that
    /// themselves contain dots round-trip correctly.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let dot = encoded.rfind('.').ok_or_else(|| {
            RatchetError::InvalidArgument(format!("not a valid address: {encoded:?}"))
        })?;
        let (id, device_part) = (&encoded[..dot], &encoded[dot + 1..]);
        if id.is_empty() {
            return Err(RatchetError::InvalidArgument(format!(
                "not a valid address: {encoded:?}"
            )));
        }
        if device_part.is_empty() || !device_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RatchetError::InvalidArgument(format!("bad device_id in {encoded:?}")));
        }
        let device_id: u32 = device_part
            .parse()
            .map_err(|_| RatchetError::InvalidArgument(format!("bad device_id in {encoded:?}")))?;
        Ok(ProtocolAddress {
            id: id.to_string(),
            device_id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Bucket key for the per-peer queue and the storage key prefix.
    pub fn to_encoded(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let addr = ProtocolAddress::new("alice", 1).unwrap();
        assert_eq!(addr.to_encoded(), "alice.1");
        assert_eq!(ProtocolAddress::from_encoded("alice.1").unwrap(), addr);
    }

    #[test]
    fn id_with_dots_splits_on_last() {
        let addr = ProtocolAddress::from_encoded("a.b.c.7").unwrap();
        assert_eq!(addr.id(), "a.b.c");
        assert_eq!(addr.device_id(), 7);
    }

    #[test]
    fn constructor_rejects_dotted_id() {
        assert!(ProtocolAddress::new("a.b", 1).is_err());
    }

    #[test]
    fn parse_rejects_non_integer_device() {
        assert!(ProtocolAddress::from_encoded("alice.x").is_err());
    }

    #[test]
    fn parse_rejects_signed_device_id() {
        assert!(ProtocolAddress::from_encoded("alice.+7").is_err());
        assert!(ProtocolAddress::from_encoded("alice.-7").is_err());
    }
}
