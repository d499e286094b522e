//! Secret reference resolution for deployment definitions.
//!
//! Deployment definitions may embed `[dsm:<key>]` references anywhere a
//! string leaf value appears. Before a definition is transmitted to an agent,
//! every reference is replaced with the secret's current value. The encrypted
//! store behind [`SecretStore`] lives elsewhere — this module only defines the
//! boundary and the substitution walk.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::info;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[dsm:([^\]\s]+)\]").expect("placeholder regex"));

/// Source of current secret values, keyed by reference name.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// A definition referenced a key the store does not hold. The definition
    /// must not be transmitted half-resolved.
    #[error("unknown secret key: {0}")]
    UnknownKey(String),
}

/// Plain in-memory store; also the loader target for `{data_dir}/secrets.toml`.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: HashMap<String, String>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{data_dir}/secrets.toml` (a flat `key = "value"` table).
    /// A missing file is an empty store.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("secrets.toml");
        let secrets: HashMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!(count = secrets.len(), "secrets loaded");
        Ok(Self { secrets })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InMemorySecretStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            secrets: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.secrets.get(key).cloned()
    }
}

/// Return a structurally identical value with every `[dsm:<key>]` occurrence
/// in string leaves replaced by the secret's value. Non-string leaves pass
/// through untouched.
pub fn resolve_placeholders(value: &Value, store: &dyn SecretStore) -> Result<Value, SecretError> {
    match value {
        Value::String(s) => Ok(Value::String(resolve_str(s, store)?)),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_placeholders(item, store))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_placeholders(v, store).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_str(s: &str, store: &dyn SecretStore) -> Result<String, SecretError> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(s) {
        let whole = captures.get(0).expect("match 0");
        let key = &captures[1];
        let secret = store
            .get(key)
            .ok_or_else(|| SecretError::UnknownKey(key.to_string()))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&secret);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemorySecretStore {
        InMemorySecretStore::from_iter([("db.password", "hunter2"), ("api.token", "t0k3n")])
    }

    #[test]
    fn replaces_placeholders_in_nested_string_leaves() {
        let definition = json!({
            "env": {
                "DB_PASSWORD": "[dsm:db.password]",
                "CONN": "postgres://app:[dsm:db.password]@db:5432/app",
            },
            "args": ["--token", "[dsm:api.token]"],
            "replicas": 1,
        });
        let resolved = resolve_placeholders(&definition, &store()).unwrap();
        assert_eq!(resolved["env"]["DB_PASSWORD"], "hunter2");
        assert_eq!(resolved["env"]["CONN"], "postgres://app:hunter2@db:5432/app");
        assert_eq!(resolved["args"][1], "t0k3n");
        assert_eq!(resolved["replicas"], 1);
    }

    #[test]
    fn unknown_key_is_a_hard_error() {
        let definition = json!({"token": "[dsm:missing]"});
        let err = resolve_placeholders(&definition, &store()).unwrap_err();
        assert!(matches!(err, SecretError::UnknownKey(k) if k == "missing"));
    }

    #[test]
    fn strings_without_placeholders_pass_through() {
        let definition = json!({"image": "registry.example.com/web:1.0"});
        let resolved = resolve_placeholders(&definition, &store()).unwrap();
        assert_eq!(resolved, definition);
    }
}
