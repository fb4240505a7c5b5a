//! Configuration sources.
//!
//! A source hands out one raw section per backend namespace. The section is a
//! table keyed by logical instance name:
//!
//! ```toml
//! [redis.default]
//! address = "127.0.0.1:6379"
//!
//! [redis.sessions]
//! addrs = ["10.0.0.5:6379", "10.0.0.6:6379"]
//! pool_size = 32
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::options::Options;

/// Anything that can supply a configuration section for a namespace.
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    /// Raw section for `namespace`, or `None` when the source has none.
    fn section(&self, namespace: &str) -> Result<Option<serde_json::Value>, ConfigError>;
}

/// Source with no configuration at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySource;

impl ConfigSource for EmptySource {
    fn section(&self, _namespace: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        Ok(None)
    }
}

/// A TOML document with one table per backend namespace.
#[derive(Debug, Clone, Default)]
pub struct TomlSource {
    root: toml::Table,
}

impl TomlSource {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let root: toml::Table = toml::from_str(content)?;
        Ok(Self { root })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Namespaces present in the document.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }
}

impl ConfigSource for TomlSource {
    fn section(&self, namespace: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        let Some(value) = self.root.get(namespace) else {
            return Ok(None);
        };
        serde_json::to_value(value)
            .map(Some)
            .map_err(|source| ConfigError::Decode {
                namespace: namespace.to_string(),
                source,
            })
    }
}

/// An in-memory JSON document, mostly for embedding callers and tests.
#[derive(Debug, Clone, Default)]
pub struct JsonSource {
    root: serde_json::Value,
}

impl JsonSource {
    pub fn new(root: serde_json::Value) -> Self {
        Self { root }
    }
}

impl ConfigSource for JsonSource {
    fn section(&self, namespace: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        Ok(self.root.get(namespace).cloned())
    }
}

/// Decode a namespace section into per-name options.
///
/// A missing or empty section yields an empty map.
pub fn decode_section(
    source: &dyn ConfigSource,
    namespace: &str,
) -> Result<BTreeMap<String, Options>, ConfigError> {
    let Some(section) = source.section(namespace)? else {
        return Ok(BTreeMap::new());
    };
    if section.is_null() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_value(section).map_err(|source| ConfigError::Decode {
        namespace: namespace.to_string(),
        source,
    })
}
