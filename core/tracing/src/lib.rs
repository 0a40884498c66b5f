// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use portrpc_config::component::configuration::Configuration;

#[derive(Error, Debug)]
pub enum TracingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),
    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TracingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default = "default_display_thread_names")]
    display_thread_names: bool,

    #[serde(default = "default_display_thread_ids")]
    display_thread_ids: bool,

    /// env-filter directives, e.g. "portrpc=debug,info"; empty means
    /// "use log_level for everything"
    #[serde(default = "default_filter")]
    filter: String,
}

// default implementation for TracingConfiguration
impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: default_log_level(),
            display_thread_names: default_display_thread_names(),
            display_thread_ids: default_display_thread_ids(),
            filter: default_filter(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_display_thread_names() -> bool {
    true
}

fn default_display_thread_ids() -> bool {
    false
}

fn default_filter() -> String {
    String::new()
}

// function to convert string tracing level to tracing::Level
fn resolve_level(level: &str) -> Option<Level> {
    let level = level.to_lowercase();
    match level.as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

impl TracingConfiguration {
    pub fn with_log_level(self, log_level: String) -> Self {
        TracingConfiguration { log_level, ..self }
    }

    pub fn with_display_thread_names(self, display_thread_names: bool) -> Self {
        TracingConfiguration {
            display_thread_names,
            ..self
        }
    }

    pub fn with_display_thread_ids(self, display_thread_ids: bool) -> Self {
        TracingConfiguration {
            display_thread_ids,
            ..self
        }
    }

    pub fn with_filter(self, filter: String) -> Self {
        TracingConfiguration { filter, ..self }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn display_thread_names(&self) -> bool {
        self.display_thread_names
    }

    pub fn display_thread_ids(&self) -> bool {
        self.display_thread_ids
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn env_filter(&self) -> Result<EnvFilter, TracingError> {
        let directives = if self.filter.is_empty() {
            let level = resolve_level(&self.log_level)
                .ok_or_else(|| TracingError::InvalidLevel(self.log_level.clone()))?;
            level.to_string().to_lowercase()
        } else {
            self.filter.clone()
        };

        EnvFilter::try_new(&directives).map_err(|e| TracingError::InvalidFilter(e.to_string()))
    }

    /// Set up a subscriber that logs to stdout
    pub fn setup_tracing_subscriber(&self) -> Result<(), TracingError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_thread_names(self.display_thread_names)
            .with_thread_ids(self.display_thread_ids)
            .try_init()
            .map_err(|e| TracingError::AlreadyInitialized(e.to_string()))
    }
}

impl Configuration for TracingConfiguration {
    type Error = TracingError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.env_filter().map(|_| ())
    }
}
