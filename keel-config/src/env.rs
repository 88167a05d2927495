// Environment variable loading

use serde_json::{Map, Value};
use std::env;

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "KEEL_";

/// Separator between nested keys, as in `KEEL_SCHEDULING__BIZ_POOL_SIZE`.
pub const NESTING_SEPARATOR: &str = "__";

/// Environment variable loader
///
/// Variables carrying the prefix become a nested table: the prefix is
/// stripped, the rest is lowercased and split on `__`. Values that parse as
/// JSON scalars (numbers, booleans) keep that type; everything else stays a
/// string.
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reads the process environment.
    pub fn load(&self) -> Value {
        self.load_from(env::vars())
    }

    /// Builds the table from explicit pairs.
    pub fn load_from<I, K, V>(&self, vars: I) -> Value
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut root = Map::new();
        for (key, value) in vars {
            let Some(rest) = key.as_ref().strip_prefix(&self.prefix) else {
                continue;
            };
            let path: Vec<String> = rest
                .split(NESTING_SEPARATOR)
                .map(str::to_lowercase)
                .collect();
            if path.iter().any(String::is_empty) {
                tracing::debug!(key = key.as_ref(), "Ignoring malformed config variable");
                continue;
            }
            insert_path(&mut root, &path, scalar(value.as_ref()));
        }
        Value::Object(root)
    }

    /// Loads a single variable by its unprefixed name.
    pub fn load_var(&self, key: &str) -> Option<String> {
        env::var(format!("{}{}", self.prefix, key.to_uppercase())).ok()
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert(last.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

fn scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_keys() {
        let loader = EnvLoader::default();
        let value = loader.load_from([
            ("KEEL_SERVER__ADDR", "0.0.0.0:9000"),
            ("KEEL_SCHEDULING__BIZ_POOL_SIZE", "8"),
            ("KEEL_LOGGING__LEVEL", "debug"),
            ("OTHER_VAR", "ignored"),
        ]);
        assert_eq!(
            value,
            json!({
                "server": {"addr": "0.0.0.0:9000"},
                "scheduling": {"biz_pool_size": 8},
                "logging": {"level": "debug"},
            })
        );
    }

    #[test]
    fn test_malformed_keys_skipped() {
        let loader = EnvLoader::new("APP_");
        let value = loader.load_from([("APP_A____B", "x"), ("APP_FLAG", "true")]);
        assert_eq!(value, json!({"flag": true}));
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::default();
        assert_eq!(loader.load_var_or("NONEXISTENT_VAR_12345", "default"), "default");
        assert!(loader.load_var("MISSING_VAR_67890").is_none());
    }
}
