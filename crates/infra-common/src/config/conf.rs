use super::range::Range;
use crate::errors::types::{Error, Result};
use std::collections::HashMap;

/// Typed key lookups over some configuration source.
///
/// Implementors only provide [`Conf::get_str`]; the typed getters are derived
/// from it.
pub trait Conf {
    /// Raw value for `key`, if present
    fn get_str(&self, key: &str) -> Option<&str>;

    /// Boolean value: `yes/no`, `true/false`, `on/off`, `enable/disable`, `1/0`
    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "enable" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "disable" => Ok(Some(false)),
            _ => Err(Error::malformed(key, value, "boolean")),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::malformed(key, value, "unsigned integer"))
    }

    /// Numeric range written `min-max`; a single number yields `n-n`
    fn get_range(&self, key: &str) -> Result<Option<Range>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        Range::parse(value)
            .map(Some)
            .ok_or_else(|| Error::malformed(key, value, "range"))
    }

    /// Comma-separated pair such as `alsa,default`; the second half is optional
    fn get_csv(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        let (first, second) = match value.split_once(',') {
            Some((a, b)) => (a.trim(), Some(b.trim())),
            None => (value.trim(), None),
        };
        if first.is_empty() {
            return Err(Error::malformed(key, value, "comma-separated pair"));
        }
        Ok(Some((
            first.to_string(),
            second.filter(|s| !s.is_empty()).map(str::to_string),
        )))
    }
}

/// In-memory [`Conf`] backed by a hash map
#[derive(Debug, Clone, Default)]
pub struct ConfMap {
    entries: HashMap<String, String>,
}

impl ConfMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Conf for ConfMap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl Conf for HashMap<String, String> {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ConfMap {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
