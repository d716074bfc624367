//! Flat key-value settings with numbered sub-maps
//!
//! Nested entities are stored as `<prefix><index>` keys next to an explicit
//! count key, e.g. `BuildTargetsCount: 2`, `BuildTarget.0: {...}`,
//! `BuildTarget.1: {...}`. A key announced by the count but missing from the
//! map means the document is corrupted.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsMap {
    values: Map<String, Value>,
}

impl SettingsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value that must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => Err(Error::Corruption(format!(
                "expected a settings object, got {other}"
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    /// Read a settings document, `None` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_value(value).map(Some)
    }

    /// Write the document, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.values)?;
        fs::write(path, content + "\n")?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_map(&mut self, key: &str, map: SettingsMap) {
        self.values.insert(key.to_string(), map.into_value());
    }

    fn require(&self, key: &str) -> Result<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| Error::Corruption(format!("missing key {key}")))
    }

    fn mistyped(key: &str, expected: &str) -> Error {
        Error::Corruption(format!("key {key} is not {expected}"))
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.require(key)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Self::mistyped(key, "a string"))
    }

    pub fn require_map(&self, key: &str) -> Result<SettingsMap> {
        Self::from_value(self.require(key)?.clone())
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read `count_key` entries stored under `<prefix><index>`
    pub fn read_list<T>(
        &self,
        count_key: &str,
        prefix: &str,
        mut parse: impl FnMut(SettingsMap) -> Result<T>,
    ) -> Result<Vec<T>> {
        let count = self.i64_or(count_key, 0);
        if count < 0 {
            return Err(Error::Corruption(format!("negative {count_key}")));
        }
        (0..count)
            .map(|i| self.require_map(&format!("{prefix}{i}")).and_then(&mut parse))
            .collect()
    }

    /// Store `items` as `count_key` plus `<prefix><index>` entries
    pub fn write_list(
        &mut self,
        count_key: &str,
        prefix: &str,
        items: impl IntoIterator<Item = SettingsMap>,
    ) {
        let stale: Vec<String> = self
            .values
            .keys()
            .filter(|k| {
                k.strip_prefix(prefix)
                    .is_some_and(|rest| rest.parse::<usize>().is_ok())
            })
            .cloned()
            .collect();
        for key in stale {
            self.values.remove(&key);
        }

        let mut count = 0usize;
        for (i, item) in items.into_iter().enumerate() {
            self.set_map(&format!("{prefix}{i}"), item);
            count += 1;
        }
        self.set(count_key, count);
    }
}
