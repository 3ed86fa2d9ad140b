//! `{event: string, data: {string -> string}}` message assembly and parsing.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub event: String,
    pub data: BTreeMap<String, String>,
}

impl Message {
    pub fn new(event: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// All data values are written as JSON strings, regardless of how
    /// they were originally typed.
    pub fn assemble(&self) -> String {
        let data: serde_json::Map<String, Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let object = serde_json::json!({
            "event": self.event,
            "data": data,
        });
        object.to_string()
    }

    /// Unknown top-level keys are ignored. Scalar data values are
    /// coerced to strings: strings as-is, numbers via their decimal
    /// rendering, booleans as `"true"`/`"false"`, null as `"null"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| NodeError::Protocol(format!("malformed JSON message: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| NodeError::Protocol("message is not a JSON object".into()))?;

        let event = object
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Protocol("message is missing string field 'event'".into()))?
            .to_string();

        let mut data = BTreeMap::new();
        if let Some(raw_data) = object.get("data") {
            let raw_data = raw_data
                .as_object()
                .ok_or_else(|| NodeError::Protocol("message field 'data' is not an object".into()))?;
            for (key, value) in raw_data {
                data.insert(key.clone(), scalar_to_string(value));
            }
        }

        Ok(Message { event, data })
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| NodeError::Protocol(format!("event '{}' missing field '{key}'", self.event)))
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_string_values() {
        let mut data = BTreeMap::new();
        data.insert("token".to_string(), "abc".to_string());
        data.insert("exp_time".to_string(), "1800".to_string());
        let msg = Message::new("revoke_jwt", data);

        let parsed = Message::parse(&msg.assemble()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn coerces_non_string_scalars() {
        let raw = r#"{"event":"x","data":{"n":42,"f":1.5,"b":true,"z":null,"s":"hi"}}"#;
        let msg = Message::parse(raw).unwrap();
        assert_eq!(msg.data["n"], "42");
        assert_eq!(msg.data["f"], "1.5");
        assert_eq!(msg.data["b"], "true");
        assert_eq!(msg.data["z"], "null");
        assert_eq!(msg.data["s"], "hi");
    }

    #[test]
    fn ignores_unknown_top_level_keys() {
        let raw = r#"{"event":"x","data":{},"extra":"ignored"}"#;
        let msg = Message::parse(raw).unwrap();
        assert_eq!(msg.event, "x");
    }

    #[test]
    fn rejects_non_object_messages() {
        assert!(Message::parse("[1,2,3]").is_err());
        assert!(Message::parse(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn missing_data_is_empty_map() {
        let msg = Message::parse(r#"{"event":"keepalive"}"#).unwrap();
        assert!(msg.data.is_empty());
    }
}
