//! Versioned JSON envelope for structured columns.
//!
//! Payloads, recurrence rules, run steps and working memory are written as
//! `{"v": 1, "data": …}`. Encoding and decoding happen here and nowhere else.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DatabaseError;

/// Current schema version of every JSON column.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(serde::Deserialize)]
struct Envelope<T> {
    v: u32,
    data: T,
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(&EnvelopeRef {
        v: SCHEMA_VERSION,
        data: value,
    })
    .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    let envelope: Envelope<T> = serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))?;
    if envelope.v > SCHEMA_VERSION {
        return Err(DatabaseError::Serialization(format!(
            "{column}: schema version {} is newer than supported {}",
            envelope.v, SCHEMA_VERSION
        )));
    }
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::Recurrence;

    #[test]
    fn envelope_shape() {
        let raw = encode(&Recurrence::Every { interval_ms: 5 }).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["data"]["kind"], "every");
    }

    #[test]
    fn newer_version_rejected() {
        let raw = r#"{"v": 99, "data": {"kind": "once"}}"#;
        let result: Result<Recurrence, _> = decode("recurrence_json", raw);
        assert!(matches!(result, Err(DatabaseError::Serialization(msg)) if msg.contains("recurrence_json")));
    }

    #[test]
    fn bare_json_rejected() {
        let result: Result<Recurrence, _> = decode("recurrence_json", r#"{"kind":"once"}"#);
        assert!(result.is_err());
    }
}
