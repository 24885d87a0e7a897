//! Persisted, section-keyed settings
//!
//! Settings live in a TOML file where every section is a table of string values:
//!
//! ```toml
//! [platform]
//! hw = "bb60"
//!
//! [bb60-configs]
//! ref-level = "-20"
//! decimation = "2"
//! ```
//!
//! Nothing here knows what the keys mean; the platforms and the resolver interpret them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{ConfigurationError, StoreError};

/// Section holding the globally selected platform
pub const PLATFORM_SECTION: &str = "platform";
/// Key in [`PLATFORM_SECTION`] naming the selected platform
pub const PLATFORM_KEY: &str = "hw";

/// The settings section belonging to one platform
pub fn platform_section(platform: &str) -> String {
    format!("{platform}-configs")
}

/// An owned copy of one section, handed to resolvers and platform factories
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    name: String,
    values: BTreeMap<String, String>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder used mostly by tests
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_owned(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse `key` if present, reporting the offending value otherwise
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigurationError::InvalidSetting {
                    section: self.name.clone(),
                    key: key.to_owned(),
                    value: raw.to_owned(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Parse `key`, falling back to `default` when absent
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The persisted key/value store
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigStore {
    /// `~/.iq_slurper/config.toml`
    pub fn default_path() -> Result<PathBuf, StoreError> {
        directories::BaseDirs::new()
            .map(|d| d.home_dir().join(".iq_slurper").join("config.toml"))
            .ok_or(StoreError::NoHomeDir)
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let sections = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| StoreError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            parse_sections(&contents, path)?
        } else {
            debug!(path = %path.display(), "No settings file, starting empty");
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            sections,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
            .unwrap_or(default)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl ToString) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_string());
    }

    /// Snapshot a section, empty if it was never written
    pub fn section(&self, section: &str) -> Section {
        Section {
            name: section.to_owned(),
            values: self.sections.get(section).cloned().unwrap_or_default(),
        }
    }

    /// The platform chosen with `set-platform`
    pub fn selected_platform(&self) -> Result<&str, ConfigurationError> {
        match self.get(PLATFORM_SECTION, PLATFORM_KEY, "") {
            "" => Err(ConfigurationError::NoPlatformSelected),
            hw => Ok(hw),
        }
    }

    /// Write back to the file this store was loaded from (no-op for in-memory stores)
    pub fn save(&self) -> Result<(), StoreError> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut table = toml::Table::new();
        for (name, values) in &self.sections {
            let section: toml::Table = values
                .iter()
                .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
                .collect();
            table.insert(name.clone(), toml::Value::Table(section));
        }
        let contents = toml::to_string(&table)?;
        std::fs::write(path, contents).map_err(|e| StoreError::Write {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "Settings saved");
        Ok(())
    }
}

fn parse_sections(
    contents: &str,
    path: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, StoreError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| StoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut sections = BTreeMap::new();
    for (name, value) in table {
        let inner = value.as_table().ok_or_else(|| StoreError::Parse {
            path: path.to_path_buf(),
            message: format!("`{name}` is not a section"),
        })?;
        let mut values = BTreeMap::new();
        for (k, v) in inner {
            // Hand-edited files may carry bare numbers and booleans
            let v = match v {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.insert(k.clone(), v);
        }
        sections.insert(name, values);
    }
    Ok(sections)
}
