//! Descriptor operations: a domain plus an ordered list of key/value pairs.

use serde::{Deserialize, Serialize};

/// One key/value pair of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub key: String,
    pub value: String,
}

/// An operation described the way a proxy describes a request to a rate
/// limit service, e.g. `domain: edge, entries: [remote_address=10.0.0.1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub entries: Vec<DescriptorEntry>,
}

impl Descriptor {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push(DescriptorEntry {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// The value of the first entry with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Join the values of `keys` with `|`, or `None` if any key is missing.
    pub fn target(&self, keys: &[String]) -> Option<String> {
        let values: Option<Vec<&str>> = keys.iter().map(|k| self.get(k)).collect();
        values.map(|v| v.join("|"))
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect();

        write!(f, "{}:{}", self.domain, entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> Descriptor {
        Descriptor::new("edge")
            .with_entry("source", "client_a")
            .with_entry("destination", "service_b")
    }

    #[test]
    fn test_lookup() {
        let d = descriptor();
        assert_eq!(d.get("source"), Some("client_a"));
        assert_eq!(d.get("destination"), Some("service_b"));
        assert_eq!(d.get("missing"), None);
    }

    #[test]
    fn test_target_joins_values_in_key_order() {
        let d = descriptor();
        let keys = vec!["destination".to_string(), "source".to_string()];
        assert_eq!(d.target(&keys).as_deref(), Some("service_b|client_a"));

        let keys = vec!["source".to_string(), "missing".to_string()];
        assert_eq!(d.target(&keys), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(descriptor().to_string(), "edge:source=client_a,destination=service_b");
    }

    #[test]
    fn test_deserialize_json() {
        let d: Descriptor = serde_json::from_str(
            r#"{"domain":"edge","entries":[{"key":"source","value":"client_a"},{"key":"destination","value":"service_b"}]}"#,
        )
        .unwrap();
        assert_eq!(d, descriptor());
    }
}
