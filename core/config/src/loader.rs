// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader parses a YAML document once and hands out typed sections.
// Each section is validated through the Configuration trait when requested,
// so callers that only need tracing can proceed even if other sections are
// absent or broken.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value, from_str};
use thiserror::Error;
use tracing::debug;

use crate::component::configuration::Configuration;

#[derive(Error, Debug)]
pub enum ConfigError {
    // File / I/O
    #[error("not found: {0}")]
    NotFound(String),

    // Parsing / structural validity
    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - missing section {0}")]
    MissingSection(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),

    // YAML decoding (typed propagation)
    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: Mapping,
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let root: Value = from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?;

        let root = match root {
            Value::Mapping(mapping) => mapping,
            // an empty document is a valid, empty configuration
            Value::Null => Mapping::new(),
            _ => return Err(ConfigError::InvalidYaml),
        };

        Ok(Self { root })
    }

    /// Top-level keys present in the document.
    pub fn keys(&self) -> Vec<String> {
        self.root
            .keys()
            .filter_map(|k| k.as_str())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn has_section(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    /// Deserialize and validate the section stored under `key`.
    pub fn section<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Configuration,
    {
        let value = self
            .root
            .get(key)
            .ok_or_else(|| ConfigError::MissingSection(key.to_string()))?;

        let section: T = serde_yaml::from_value(value.clone())?;
        section
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))?;

        debug!(%key, "configuration section loaded");
        Ok(section)
    }

    /// Like [`ConfigLoader::section`], falling back to `T::default()` when the
    /// key is not present.
    pub fn section_or_default<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Configuration + Default,
    {
        if !self.has_section(key) {
            return Ok(T::default());
        }

        self.section(key)
    }
}
