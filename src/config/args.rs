use std::path::PathBuf;

use serde_json::{Map, Value};

/// Opaque job arguments (`module_args`).
///
/// The orchestrator passes them through untouched; every job picks the keys
/// it knows about and falls back to its own defaults for absent ones.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct ModuleArgs(Map<String, Value>);

impl ModuleArgs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// String value of `key`; numbers and booleans are stringified.
    pub fn str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn path_or(&self, key: &str, default: impl Into<PathBuf>) -> PathBuf {
        self.str(key)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default.into())
    }

    /// Port number given as number or numeric string.
    pub fn port_or(&self, key: &str, default: u16) -> u16 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .unwrap_or_else(|| {
            if self.0.contains_key(key) {
                log::warn!(target: "config", "Ignoring invalid port in '{key}', using {default}");
            }
            default
        })
    }

    /// List given as array of strings or as a single (comma separated) string.
    pub fn list_or(&self, key: &str, default: &[&str]) -> Vec<String> {
        let list: Vec<String> = match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .collect(),
            Some(Value::String(s)) => s.split(',').map(|s| s.trim().to_string()).collect(),
            _ => Vec::new(),
        };
        let list: Vec<String> = list.into_iter().filter(|s| !s.is_empty()).collect();

        if list.is_empty() {
            default.iter().map(|s| s.to_string()).collect()
        } else {
            list
        }
    }
}
