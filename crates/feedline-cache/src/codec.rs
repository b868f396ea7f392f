//! Transport-safe text encoding for cache payloads.
//!
//! Payloads are serialized to JSON and then walked once:
//!
//! - integers outside ±(2^53 − 1) become `{"$bigint": "<decimal>"}` so that
//!   consumers with double-precision numbers cannot lose digits
//! - single-key objects whose key is `$bigint` or `$object` are wrapped as
//!   `{"$object": {...}}` so user data is never mistaken for a tag
//!
//! Timestamps and non-string-keyed maps are tagged by the [`timestamp`] and
//! [`pairs`] serde adapters on the fields that carry them (`$date`, `$map`).
//! The walk leaves those tags alone in both directions.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::error::CodecError;

/// Largest integer a double can represent exactly.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

const BIGINT_TAG: &str = "$bigint";
const OBJECT_TAG: &str = "$object";

/// Encode a payload into its textual form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&tag(value))?)
}

/// Decode a payload previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(serde_json::from_value(untag(value)?)?)
}

fn is_safe(n: &Number) -> bool {
    if let Some(i) = n.as_i64() {
        return (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i);
    }
    if n.as_u64().is_some() {
        // Only reached for values above i64::MAX.
        return false;
    }
    true
}

fn is_reserved(map: &Map<String, Value>) -> bool {
    map.len() == 1
        && map
            .keys()
            .next()
            .is_some_and(|k| k == BIGINT_TAG || k == OBJECT_TAG)
}

fn tag(value: Value) -> Value {
    match value {
        Value::Number(n) if !is_safe(&n) => {
            let mut map = Map::new();
            map.insert(BIGINT_TAG.to_string(), Value::String(n.to_string()));
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(tag).collect()),
        Value::Object(map) => {
            let reserved = is_reserved(&map);
            let map: Map<String, Value> = map.into_iter().map(|(k, v)| (k, tag(v))).collect();
            if reserved {
                let mut wrapper = Map::new();
                wrapper.insert(OBJECT_TAG.to_string(), Value::Object(map));
                Value::Object(wrapper)
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

fn untag(value: Value) -> Result<Value, CodecError> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items.into_iter().map(untag).collect::<Result<_, _>>()?,
        )),
        Value::Object(mut map) if map.len() == 1 && map.contains_key(BIGINT_TAG) => {
            let raw = map.remove(BIGINT_TAG).unwrap_or(Value::Null);
            parse_bigint(raw).map(Value::Number)
        }
        Value::Object(mut map) if map.len() == 1 && map.contains_key(OBJECT_TAG) => {
            match map.remove(OBJECT_TAG) {
                Some(Value::Object(inner)) => untag_fields(inner),
                _ => Err(CodecError::InvalidTag {
                    tag: OBJECT_TAG,
                    reason: "expected an object".to_string(),
                }),
            }
        }
        Value::Object(map) => untag_fields(map),
        other => Ok(other),
    }
}

fn untag_fields(map: Map<String, Value>) -> Result<Value, CodecError> {
    let map = map
        .into_iter()
        .map(|(k, v)| untag(v).map(|v| (k, v)))
        .collect::<Result<Map<_, _>, _>>()?;
    Ok(Value::Object(map))
}

fn parse_bigint(raw: Value) -> Result<Number, CodecError> {
    let Value::String(text) = raw else {
        return Err(CodecError::InvalidTag {
            tag: BIGINT_TAG,
            reason: "expected a decimal string".to_string(),
        });
    };
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Number::from(i));
    }
    text.parse::<u64>()
        .map(Number::from)
        .map_err(|e| CodecError::InvalidTag {
            tag: BIGINT_TAG,
            reason: format!("{text}: {e}"),
        })
}

/// Serde adapter tagging `DateTime<Utc>` as `{"$date": "<rfc3339>"}`.
///
/// Nanosecond precision is kept so values round-trip exactly.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Tagged {
        #[serde(rename = "$date")]
        date: String,
    }

    fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        Tagged { date: format(value) }.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let tagged = Tagged::deserialize(d)?;
        DateTime::parse_from_rfc3339(&tagged.date)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    /// Same tagging for `Option<DateTime<Utc>>`; `None` stays `null`.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            value.as_ref().map(|v| Tagged { date: format(v) }).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<Tagged>::deserialize(d)?
                .map(|tagged| {
                    DateTime::parse_from_rfc3339(&tagged.date)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(serde::de::Error::custom)
                })
                .transpose()
        }
    }
}

/// Serde adapter tagging maps as `{"$map": [[key, value], ...]}`.
///
/// Keys keep their own type instead of being stringified.
pub mod pairs {
    use std::collections::BTreeMap;

    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct TaggedRef<'a, K, V> {
        #[serde(rename = "$map")]
        entries: Vec<(&'a K, &'a V)>,
    }

    #[derive(Deserialize)]
    #[serde(bound = "K: DeserializeOwned, V: DeserializeOwned")]
    struct Tagged<K, V> {
        #[serde(rename = "$map")]
        entries: Vec<(K, V)>,
    }

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, s: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize + Ord,
        V: Serialize,
        S: Serializer,
    {
        TaggedRef {
            entries: map.iter().collect(),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, K, V, D>(d: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: DeserializeOwned + Ord,
        V: DeserializeOwned,
        D: Deserializer<'de>,
    {
        Ok(Tagged::<K, V>::deserialize(d)?.entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        id: i64,
        grouped_id: Option<i64>,
        #[serde(with = "timestamp")]
        date: DateTime<Utc>,
        #[serde(with = "timestamp::option")]
        edited: Option<DateTime<Utc>>,
        #[serde(with = "pairs")]
        cursors: BTreeMap<i64, u64>,
        labels: BTreeMap<String, String>,
    }

    fn payload() -> Payload {
        let mut cursors = BTreeMap::new();
        cursors.insert(-1_001_234_567_890_123, u64::MAX);
        cursors.insert(7, 9);
        let mut labels = BTreeMap::new();
        labels.insert("$bigint".to_string(), "not a number".to_string());
        Payload {
            id: 42,
            grouped_id: Some(13_571_113_171_923_293),
            date: Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap(),
            edited: None,
            cursors,
            labels,
        }
    }

    #[test]
    fn test_roundtrip_preserves_payload() {
        let original = payload();
        let text = encode(&original).unwrap();
        let decoded: Payload = decode(&text).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_large_integers_are_tagged() {
        let text = encode(&json!({ "small": 5, "big": 13_571_113_171_923_293i64 })).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["small"], json!(5));
        assert_eq!(raw["big"], json!({ "$bigint": "13571113171923293" }));
    }

    #[test]
    fn test_safe_boundary_is_not_tagged() {
        let text = encode(&json!([MAX_SAFE_INTEGER, -MAX_SAFE_INTEGER])).unwrap();
        assert_eq!(text, format!("[{},{}]", MAX_SAFE_INTEGER, -MAX_SAFE_INTEGER));
    }

    #[test]
    fn test_u64_above_i64_roundtrips() {
        let text = encode(&vec![u64::MAX]).unwrap();
        let decoded: Vec<u64> = decode(&text).unwrap();
        assert_eq!(decoded, vec![u64::MAX]);
    }

    #[test]
    fn test_dates_and_maps_are_tagged() {
        let text = encode(&payload()).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            raw["date"],
            json!({ "$date": "2023-11-14T22:13:20.123456789Z" })
        );
        assert!(raw["cursors"]["$map"].is_array());
        assert_eq!(raw["edited"], Value::Null);
    }

    #[test]
    fn test_colliding_user_object_is_escaped() {
        let text = encode(&json!({ "$bigint": "7" })).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw, json!({ "$object": { "$bigint": "7" } }));

        let decoded: Value = decode(&text).unwrap();
        assert_eq!(decoded, json!({ "$bigint": "7" }));
    }

    #[test]
    fn test_malformed_bigint_is_rejected() {
        let err = decode::<Value>(r#"{"$bigint": 5}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidTag { tag: "$bigint", .. }));
    }
}
