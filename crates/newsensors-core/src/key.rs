//! Device keys: the join key between telemetry samples and registry attributes

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Smallest attribute payload that can carry a key (layer tag + one id byte)
pub const MIN_KEY_BYTES: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Attribute payload is missing")]
    Missing,
    #[error("Attribute payload too short: {0} bytes, need at least {MIN_KEY_BYTES}")]
    TooShort(usize),
    #[error("Invalid device key string: {0}")]
    InvalidHex(String),
}

/// Canonical identity of a device: physical-layer tag plus device id bytes.
///
/// Equality and hashing are exact byte equality. The string form is the
/// lowercase hex of the tag byte followed by the id bytes, so two samples
/// with identical tag and id always render to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    physical_layer: u8,
    device_id: Vec<u8>,
}

impl DeviceKey {
    /// Build the key for a telemetry sample
    pub fn from_sample(physical_layer: u8, device_id: &[u8]) -> Self {
        Self {
            physical_layer,
            device_id: device_id.to_vec(),
        }
    }

    /// Extract a key from a registry attribute payload.
    ///
    /// The first byte is the physical layer, the remainder the device id.
    pub fn from_attribute(payload: Option<&[u8]>) -> Result<Self, DecodeError> {
        let payload = payload.ok_or(DecodeError::Missing)?;
        match payload.split_first() {
            Some((&physical_layer, device_id)) if payload.len() >= MIN_KEY_BYTES => {
                Ok(Self::from_sample(physical_layer, device_id))
            }
            _ => Err(DecodeError::TooShort(payload.len())),
        }
    }

    /// Split the key back into the two values written as placeholder attributes
    pub fn split_for_attributes(&self) -> (u8, &[u8]) {
        (self.physical_layer, &self.device_id)
    }

    pub fn physical_layer(&self) -> u8 {
        self.physical_layer
    }

    pub fn device_id(&self) -> &[u8] {
        &self.device_id
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{}", self.physical_layer, hex::encode(&self.device_id))
    }
}

impl FromStr for DeviceKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| DecodeError::InvalidHex(s.to_string()))?;
        if bytes.len() < MIN_KEY_BYTES {
            return Err(DecodeError::InvalidHex(s.to_string()));
        }
        Self::from_attribute(Some(bytes.as_slice()))
    }
}

/// Decode the payload of `attribute` on `identifier`, logging and skipping
/// bad payloads
pub fn decode_registry_key(
    identifier: &str,
    attribute: &str,
    payload: Option<&[u8]>,
) -> Option<DeviceKey> {
    match DeviceKey::from_attribute(payload) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(
                identifier = identifier,
                attribute = attribute,
                error = %e,
                "Skipping undecodable sensor attribute"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_sample() {
        let key = DeviceKey::from_sample(0x01, &[0xAB, 0xCD]);
        assert_eq!(key.to_string(), "01abcd");
    }

    #[test]
    fn test_key_string_length() {
        let id = [0u8; 16];
        let key = DeviceKey::from_sample(3, &id);
        assert_eq!(key.to_string().len(), id.len() * 2 + 2);
    }

    #[test]
    fn test_split_inverts_encode() {
        let samples: [(u8, &[u8]); 4] = [
            (0x01, &[0xAB, 0xCD][..]),
            (0x00, &[0x00][..]),
            (0xFF, &[0xFF; 16][..]),
            (0x7F, &[0x10, 0x00, 0x00, 0x01, 0x02][..]),
        ];
        for (tag, id) in samples {
            let key = DeviceKey::from_sample(tag, id);
            assert_eq!(key.split_for_attributes(), (tag, id));
        }
    }

    #[test]
    fn test_attribute_and_sample_keys_join() {
        let from_sample = DeviceKey::from_sample(0x01, &[0xAB, 0xCD]);
        let from_attr = DeviceKey::from_attribute(Some(&[0x01, 0xAB, 0xCD][..])).unwrap();
        assert_eq!(from_sample, from_attr);
        assert_eq!(from_sample.to_string(), from_attr.to_string());
    }

    #[test]
    fn test_distinct_layers_give_distinct_keys() {
        let a = DeviceKey::from_sample(1, &[0x02, 0x03]);
        let b = DeviceKey::from_sample(1, &[0x02, 0x03, 0x00]);
        let c = DeviceKey::from_sample(2, &[0x02, 0x03]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_short_payload_rejected() {
        assert_eq!(
            DeviceKey::from_attribute(Some(&[0x01][..])),
            Err(DecodeError::TooShort(1))
        );
        assert_eq!(
            DeviceKey::from_attribute(Some(&[][..])),
            Err(DecodeError::TooShort(0))
        );
        assert_eq!(DeviceKey::from_attribute(None), Err(DecodeError::Missing));
        assert!(decode_registry_key("lab.lamp", "sensor value", Some(&[0x01][..])).is_none());
    }

    #[test]
    fn test_decode_registry_key() {
        let key = decode_registry_key("lab.door", "sensor value", Some(&[0x01, 0xAB, 0xCD][..]));
        assert_eq!(key, Some(DeviceKey::from_sample(0x01, &[0xAB, 0xCD])));
        assert_eq!(decode_registry_key("lab.door", "sensor value", None), None);
    }

    #[test]
    fn test_parse_key_string() {
        let key: DeviceKey = "01abcd".parse().unwrap();
        assert_eq!(key.physical_layer(), 0x01);
        assert_eq!(key.device_id(), &[0xAB, 0xCD]);

        assert!("01".parse::<DeviceKey>().is_err());
        assert!("01abc".parse::<DeviceKey>().is_err());
        assert!("zz00".parse::<DeviceKey>().is_err());
    }
}
