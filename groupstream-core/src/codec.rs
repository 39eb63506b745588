//! Payload codecs and typed message descriptors

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;

/// Converts a domain value to and from the string payload stored in a stream
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String>;

    fn decode(&self, payload: &str) -> Result<T>;
}

/// JSON codec backed by serde
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, payload: &str) -> Result<T> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// A message type bound to a fixed stream
///
/// Used by [`Producer`](crate::producer::Producer) to route a value without
/// any consumer-side setup.
pub trait TypedMessage: Sized + Send + Sync + 'static {
    /// Stream id this message type is published to
    fn topic_id() -> &'static str;

    /// Codec used to encode the message
    fn codec() -> Arc<dyn Codec<Self>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
        sku: String,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<OrderPlaced>::new();
        let order = OrderPlaced {
            order_id: 7,
            sku: "A-1".to_string(),
        };

        let payload = codec.encode(&order).unwrap();
        assert!(payload.contains("\"order_id\":7"));
        assert_eq!(codec.decode(&payload).unwrap(), order);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec = JsonCodec::<OrderPlaced>::default();
        assert!(codec.decode("{\"order_id\":").is_err());
    }
}
