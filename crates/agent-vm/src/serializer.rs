//! Authenticated JSON persistence.
//!
//! Serialize: canonicalize to JSON, HMAC-sign, wrap in an envelope.
//! Deserialize: recompute the HMAC, compare in constant time, refuse to
//! load on mismatch rather than returning partial data.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::clock::{Clock, SystemClock};
use crate::error::SerializationError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// The canonical JSON text of the payload, itself stored as a JSON
    /// string (not a nested object) so the signature covers exactly the
    /// bytes a reader would re-parse.
    data: String,
    signature: String,
    timestamp: DateTime<Utc>,
}

/// HMAC-SHA256-signed JSON envelope, `{data, signature, timestamp}`, where
/// `data` is the stringified canonical JSON of the payload.
pub struct SecureSerializer {
    secret: Vec<u8>,
    clock: Box<dyn Clock>,
}

impl SecureSerializer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(secret: impl Into<Vec<u8>>, clock: Box<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            clock,
        }
    }

    /// Canonicalizes `value` to JSON, tagging any value it carries that
    /// isn't natively JSON-representable, signs the canonical text, and
    /// returns the envelope as a JSON string with `data` holding that text.
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<String, SerializationError> {
        let tagged = tag_value(serde_json::to_value(value)?);
        let data = serde_json::to_string(&tagged)?;
        let signature = self.sign(data.as_bytes());
        let envelope = Envelope {
            data,
            signature,
            timestamp: self.clock.now(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parses the envelope, recomputes the HMAC over the raw `data` string,
    /// and compares in constant time. On mismatch, fails rather than
    /// returning the (possibly tampered) data.
    pub fn deserialize<T: for<'de> Deserialize<'de>>(
        &self,
        envelope_json: &str,
    ) -> Result<T, SerializationError> {
        let envelope: Envelope = serde_json::from_str(envelope_json)?;
        let expected = self.sign(envelope.data.as_bytes());

        let matches: bool = expected.as_bytes().ct_eq(envelope.signature.as_bytes()).into();
        if !matches {
            return Err(SerializationError::SignatureMismatch);
        }

        let tagged: Value = serde_json::from_str(&envelope.data)?;
        Ok(serde_json::from_value(untag_value(tagged))?)
    }

    fn sign(&self, canonical_json: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(canonical_json);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Tagged wrapper for a value that is not natively JSON-representable.
/// Mirrors `_make_json_serializable`'s fallback order: `DateTime`/`PathBuf`
/// get a typed tag; anything else serializable only via `Display` falls
/// back to `string_repr`, whose original typed identity is not
/// recoverable on the way back.
///
/// `SecureSerializer::serialize`/`deserialize` apply this tagging
/// automatically to string leaves that look like an RFC3339 timestamp or
/// an absolute path; the `string_repr` variant has no equivalent
/// auto-detection once a value is already JSON (there is no "object serde
/// doesn't know how to encode" case left to fall back from) and is only
/// produced when a caller embeds one explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", content = "_value")]
pub enum Tagged {
    #[serde(rename = "datetime")]
    DateTime(DateTime<Utc>),
    #[serde(rename = "path")]
    Path(String),
    #[serde(rename = "string_repr")]
    StringRepr(String),
}

impl Tagged {
    pub fn datetime(value: DateTime<Utc>) -> Self {
        Tagged::DateTime(value)
    }

    pub fn path(value: impl Into<String>) -> Self {
        Tagged::Path(value.into())
    }

    pub fn string_repr(value: impl std::fmt::Display) -> Self {
        Tagged::StringRepr(value.to_string())
    }
}

/// Recursively tags string leaves that aren't natively JSON-representable
/// as a typed Rust value: RFC3339 timestamps and absolute paths. Applied
/// before signing so the signed wire format carries the same `_type`/
/// `_value` markers the original produces, even though Rust's static
/// typing means we only learn this after the value has already flattened
/// to a JSON string.
fn tag_value(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                serde_json::to_value(Tagged::datetime(dt.with_timezone(&Utc)))
                    .expect("Tagged always serializes")
            } else if s.len() > 1 && s.starts_with('/') {
                serde_json::to_value(Tagged::path(s)).expect("Tagged always serializes")
            } else {
                Value::String(s)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(tag_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| (key, tag_value(val)))
                .collect(),
        ),
        other => other,
    }
}

/// Inverse of [`tag_value`]. A tagged object unwraps to its `_value`,
/// which for all three variants is already the plain JSON form (a
/// string) the original value had.
fn untag_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let tag = map.get("_type").and_then(Value::as_str);
            let inner = map.get("_value");
            match (tag, inner) {
                (Some("datetime" | "path" | "string_repr"), Some(inner)) => inner.clone(),
                _ => Value::Object(
                    map.into_iter()
                        .map(|(key, val)| (key, untag_value(val)))
                        .collect(),
                ),
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(untag_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trips() {
        let serializer = SecureSerializer::new(b"topsecret".to_vec());
        let payload = Payload {
            name: "agent".to_string(),
            count: 3,
        };
        let envelope = serializer.serialize(&payload).unwrap();
        let restored: Payload = serializer.deserialize(&envelope).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn tampered_data_field_fails_signature() {
        let serializer = SecureSerializer::new(b"topsecret".to_vec());
        let payload = Payload {
            name: "agent".to_string(),
            count: 3,
        };
        let envelope = serializer.serialize(&payload).unwrap();
        let mut value: Value = serde_json::from_str(&envelope).unwrap();

        let mut data: Value = serde_json::from_str(value["data"].as_str().unwrap()).unwrap();
        data["count"] = serde_json::json!(999);
        value["data"] = Value::String(serde_json::to_string(&data).unwrap());
        let tampered = serde_json::to_string(&value).unwrap();

        let result: Result<Payload, _> = serializer.deserialize(&tampered);
        assert!(matches!(result, Err(SerializationError::SignatureMismatch)));
    }

    #[test]
    fn data_field_is_the_canonical_json_text_not_a_nested_object() {
        let serializer = SecureSerializer::new(b"topsecret".to_vec());
        let payload = Payload {
            name: "agent".to_string(),
            count: 3,
        };
        let envelope = serializer.serialize(&payload).unwrap();
        let value: Value = serde_json::from_str(&envelope).unwrap();
        assert!(value["data"].is_string());
    }

    #[test]
    fn tagged_datetime_round_trips_through_json() {
        let now = Utc::now();
        let tagged = Tagged::datetime(now);
        let json = serde_json::to_string(&tagged).unwrap();
        let restored: Tagged = serde_json::from_str(&json).unwrap();
        match restored {
            Tagged::DateTime(dt) => assert_eq!(dt, now),
            other => panic!("expected DateTime, got {other:?}"),
        }
    }

    #[test]
    fn datetime_field_is_tagged_on_the_wire_and_restored() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Stamped {
            at: DateTime<Utc>,
        }

        let serializer = SecureSerializer::new(b"topsecret".to_vec());
        let now = Utc::now();
        let envelope = serializer.serialize(&Stamped { at: now }).unwrap();

        let value: Value = serde_json::from_str(&envelope).unwrap();
        let data = value["data"].as_str().unwrap();
        assert!(data.contains("\"_type\":\"datetime\""));

        let restored: Stamped = serializer.deserialize(&envelope).unwrap();
        assert_eq!(restored.at, now);
    }
}
