//! Plaintext document carried inside the cookie envelope.
//!
//! A document is a JSON object with sorted keys, so two documents with the
//! same content always serialize to the same bytes. Timestamps are tagged as
//! `{"$date": <epoch ms>}` to keep them distinct from plain numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, SessionError};

/// Public session fields.
pub type Document = Map<String, Value>;

/// Reserved field holding the cookie expiry.
pub const EXPIRY_FIELD: &str = "exp";

const DATE_TAG: &str = "$date";

/// Timestamp value stored in a session document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub DateTime<Utc>);

#[derive(Serialize, Deserialize)]
struct TaggedDate {
    #[serde(rename = "$date")]
    millis: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn to_value(self) -> Value {
        let mut tagged = Map::new();
        tagged.insert(DATE_TAG.to_string(), Value::from(self.millis()));
        Value::Object(tagged)
    }

    /// Read a timestamp back from a document value. Bare numbers are taken
    /// as epoch milliseconds.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) if map.len() == 1 => {
                map.get(DATE_TAG).and_then(Value::as_i64).and_then(Self::from_millis)
            }
            Value::Number(n) => n.as_i64().and_then(Self::from_millis),
            _ => None,
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TaggedDate { millis: self.millis() }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tagged = TaggedDate::deserialize(deserializer)?;
        Self::from_millis(tagged.millis)
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

pub fn serialize(document: &Document) -> Result<Vec<u8>> {
    serde_json::to_vec(document).map_err(|e| SessionError::Document(e.to_string()))
}

pub fn parse(bytes: &[u8]) -> Result<Document> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(SessionError::Document("payload is not an object".to_string())),
        Err(e) => Err(SessionError::Document(e.to_string())),
    }
}

/// Serialization of a document with no fields.
pub fn empty() -> Vec<u8> {
    b"{}".to_vec()
}

/// Strip the reserved expiry field, returning its value.
pub fn take_expiry(document: &mut Document) -> Result<Option<Timestamp>> {
    match document.remove(EXPIRY_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Timestamp::from_value(&value)
            .map(Some)
            .ok_or_else(|| SessionError::Document(format!("{EXPIRY_FIELD} is not a timestamp"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialization_is_key_ordered() {
        let mut a = Document::new();
        a.insert("zeta".into(), json!(1));
        a.insert("alpha".into(), json!({"b": 2, "a": 1}));

        let mut b = Document::new();
        b.insert("alpha".into(), json!({"a": 1, "b": 2}));
        b.insert("zeta".into(), json!(1));

        assert_eq!(serialize(&a).unwrap(), serialize(&b).unwrap());
        assert_eq!(serialize(&Document::new()).unwrap(), empty());
    }

    #[test]
    fn test_timestamp_value() {
        let ts = Timestamp::from_millis(1_700_000_000_123).unwrap();
        assert_eq!(ts.to_value(), json!({"$date": 1_700_000_000_123i64}));
        assert_eq!(Timestamp::from_value(&ts.to_value()), Some(ts));
        assert_eq!(Timestamp::from_value(&json!(1_700_000_000_123i64)), Some(ts));
        assert_eq!(Timestamp::from_value(&json!("yesterday")), None);

        let through_serde: Timestamp = serde_json::from_value(serde_json::to_value(ts).unwrap()).unwrap();
        assert_eq!(through_serde, ts);
    }

    #[test]
    fn test_take_expiry() {
        let mut doc = parse(br#"{"user":"bob","exp":{"$date":1000}}"#).unwrap();
        assert_eq!(take_expiry(&mut doc).unwrap(), Timestamp::from_millis(1000));
        assert!(!doc.contains_key(EXPIRY_FIELD));
        assert_eq!(take_expiry(&mut doc).unwrap(), None);

        let mut doc = parse(br#"{"exp":"soon"}"#).unwrap();
        assert!(take_expiry(&mut doc).is_err());
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse(b"[1,2]").is_err());
        assert!(parse(b"\x00\x13garbage").is_err());
        assert!(parse(b"{}").unwrap().is_empty());
    }
}
