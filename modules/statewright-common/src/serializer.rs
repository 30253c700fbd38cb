//! Byte encoding for snapshots and events.
//!
//! Serializers work over a `serde_json::Value` intermediate so they stay
//! object-safe and can be shared as `Arc<dyn Serializer>`. Typed callers go
//! through [`encode`] and [`decode`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize(&self, type_hint: &str, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn deserialize(&self, type_hint: &str, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Plain JSON bytes. Readable in the database, matches the JSONB payloads the
/// rest of the stack stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, type_hint: &str, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::serialization(type_hint, e))
    }

    fn deserialize(&self, type_hint: &str, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::serialization(type_hint, e))
    }
}

pub fn encode<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    type_hint: &str,
    value: &T,
) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::serialization(type_hint, e))?;
    serializer.serialize(type_hint, &value)
}

pub fn decode<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    type_hint: &str,
    bytes: &[u8],
) -> Result<T> {
    let value = serializer.deserialize(type_hint, bytes)?;
    serde_json::from_value(value).map_err(|e| Error::serialization(type_hint, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Oven {
        temperature: u32,
        label: String,
    }

    #[test]
    fn typed_values_survive_json_encoding() {
        let oven = Oven {
            temperature: 180,
            label: "fan".into(),
        };
        let bytes = encode(&JsonSerializer, "oven", &oven).unwrap();
        let back: Oven = decode(&JsonSerializer, "oven", &bytes).unwrap();
        assert_eq!(back, oven);
    }

    #[test]
    fn decode_failure_names_the_type_hint() {
        let err = decode::<Oven>(&JsonSerializer, "oven", b"{not json").unwrap_err();
        match err {
            Error::Serialization { type_hint, .. } => assert_eq!(type_hint, "oven"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!Error::serialization("x", "y").is_retryable());
    }

    #[test]
    fn shape_mismatch_is_a_serialization_error() {
        let bytes = encode(&JsonSerializer, "oven", &serde_json::json!({"temperature": "hot"}))
            .unwrap();
        assert!(matches!(
            decode::<Oven>(&JsonSerializer, "oven", &bytes),
            Err(Error::Serialization { .. })
        ));
    }
}
