use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};

pub trait JsonEncode {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// Storage codec for every column family. JSON keeps rows greppable in
/// debugging sessions; rows are small enough that the encoding cost is noise.
pub struct JsonEncoder;

impl JsonEncode for JsonEncoder {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| anyhow!("error serializing into json: {}", e))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("error deserializing from json: {}", e))
    }
}
