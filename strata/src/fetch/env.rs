//! Environment variables accumulated from image layers.

use serde::{Deserialize, Serialize};

/// Ordered `KEY=VALUE` list without duplicate keys.
///
/// Setting an existing key replaces its value in place, so the first
/// occurrence decides the position and the last decides the value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env(Vec<(String, String)>);

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw `KEY=VALUE` entries, dropping malformed ones.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Env::new();
        for entry in entries {
            let entry = entry.as_ref();
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => env.set(key, value),
                _ => tracing::warn!(entry = %entry, "Unrecognised environment variable"),
            }
        }
        env
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Overlay `other` on top of this environment.
    pub fn merge(&mut self, other: &Env) {
        for (key, value) in &other.0 {
            self.set(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries rendered as `KEY=VALUE`.
    pub fn to_entries(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}
