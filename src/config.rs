//! Configuration payloads for scripted processes.
//!
//! Launch-time configuration is a JSON key/value document. Index keys
//! accept either an integer or a numeric string, matching what script
//! authors actually pass.

use serde_json::{json, Map, Value};

use crate::proxy::types::ParityClass;

/// Recognized keys: `driving_target_idx`, `backing_target_idx`,
/// `thread_idx`, `parity`, `pid`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConfig {
    doc: Map<String, Value>,
}

impl ScriptedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let doc = serde_json::from_str(text)?;
        Ok(Self { doc })
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(doc) => Self { doc },
            _ => Self::default(),
        }
    }

    pub fn set(&mut self, key: &str, value: Value) -> &mut Self {
        self.doc.insert(key.to_string(), value);
        self
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.doc.insert(key.to_string(), value);
        self
    }

    /// Index of the driving target within the host's target list. Falls
    /// back to `backing_target_idx`, the key used by the simpler
    /// passthrough-from-backing-target variant.
    pub fn driving_target_idx(&self) -> Option<usize> {
        self.int_value("driving_target_idx")
            .or_else(|| self.int_value("backing_target_idx"))
            .map(|v| v as usize)
    }

    /// Index of a thread within the driving process
    pub fn thread_idx(&self) -> Option<u32> {
        self.int_value("thread_idx").map(|v| v as u32)
    }

    /// Parity class for a demultiplexed process
    pub fn parity(&self) -> Option<ParityClass> {
        self.int_value("parity").map(ParityClass::from_value)
    }

    /// Process id override for passthrough processes
    pub fn pid(&self) -> Option<u64> {
        self.int_value("pid")
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    /// Integer extraction tolerant of numeric strings
    fn int_value(&self, key: &str) -> Option<u64> {
        match self.doc.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Build the per-thread payload handed to thread proxies
pub fn thread_config(driving_target_idx: usize, thread_idx: u32) -> ScriptedConfig {
    ScriptedConfig::from_value(json!({
        "driving_target_idx": driving_target_idx,
        "thread_idx": thread_idx,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_string_indexes_are_equivalent() {
        let from_int = ScriptedConfig::from_json(r#"{"driving_target_idx": 3}"#).unwrap();
        let from_str = ScriptedConfig::from_json(r#"{"driving_target_idx": "3"}"#).unwrap();
        assert_eq!(from_int.driving_target_idx(), Some(3));
        assert_eq!(from_str.driving_target_idx(), Some(3));
    }

    #[test]
    fn backing_target_idx_is_an_alias() {
        let config = ScriptedConfig::from_json(r#"{"backing_target_idx": 1}"#).unwrap();
        assert_eq!(config.driving_target_idx(), Some(1));
    }

    #[test]
    fn missing_or_malformed_keys_read_as_none() {
        let config = ScriptedConfig::from_json(r#"{"parity": [1]}"#).unwrap();
        assert!(config.driving_target_idx().is_none());
        assert!(config.parity().is_none());
        assert!(config.thread_idx().is_none());
    }

    #[test]
    fn parity_values_map_to_classes() {
        let even = ScriptedConfig::new().with("parity", json!(0));
        let odd = ScriptedConfig::new().with("parity", json!(1));
        assert_eq!(even.parity(), Some(ParityClass::Even));
        assert_eq!(odd.parity(), Some(ParityClass::Odd));
    }
}
