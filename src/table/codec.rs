//! Key and value encodings used on the wire and as access-coordinator keys.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },
    #[error("failed to decode {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },
}

pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary encoding, the default for keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

/// Human-readable encoding, handy when inspecting traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_roundtrip_vector() {
        let codec = BincodeCodec;
        let value = vec![0.5f32, -1.25, 3.0];

        let bytes = Codec::<Vec<f32>>::encode(&codec, &value).unwrap();
        let decoded = Codec::<Vec<f32>>::decode(&codec, &bytes).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_garbage_is_typed_error() {
        let codec = JsonCodec;

        let result = Codec::<i32>::decode(&codec, b"not json");

        match result {
            Err(CodecError::Decode { type_name, .. }) => assert_eq!(type_name, "i32"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }
}
