//! Base64 encoding of byte fields
//!
//! Byte slices travel as standard base64 JSON strings. A `null` or absent
//! field is read as empty bytes, which is how peers encode a nil slice.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serializer};

/// Serialize bytes as a base64 string
pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Deserialize a base64 string (or `null`) into bytes
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        None => Ok(Vec::new()),
        Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
    }
}

/// Decode a put body frame: a single JSON string holding base64 bytes
pub fn decode_body_frame(line: &str) -> Result<Vec<u8>, serde_json::Error> {
    let mut deserializer = serde_json::Deserializer::from_str(line);
    let body = deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(body)
}

/// Encode bytes as a put body frame (without the trailing newline)
pub fn encode_body_frame(body: &[u8]) -> String {
    format!("\"{}\"", STANDARD.encode(body))
}
