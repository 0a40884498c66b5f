// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;
use thiserror::Error;

use portrpc_config::component::configuration::Configuration;

use crate::protocol::MESSAGE_NUMBER_MASK;

/// Default wrap threshold for message numbers (2^24), leaving headroom
/// inside the 27-bit field.
pub const DEFAULT_MESSAGE_NUMBER_WRAP: u32 = 0x0100_0000;

pub const DEFAULT_MAX_PENDING_CALLS: usize = 8192;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigurationError {
    #[error("message number wrap must be in 1..={max}, got {value}")]
    InvalidMessageNumberWrap { value: u32, max: u32 },
    #[error("max pending calls must be greater than zero")]
    InvalidMaxPendingCalls,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatcherConfig {
    /// message numbers restart from 1 once this value is exceeded
    #[serde(default = "default_message_number_wrap")]
    pub message_number_wrap: u32,

    /// maximum number of outstanding responses and stream acks
    #[serde(default = "default_max_pending_calls")]
    pub max_pending_calls: usize,
}

fn default_message_number_wrap() -> u32 {
    DEFAULT_MESSAGE_NUMBER_WRAP
}

fn default_max_pending_calls() -> usize {
    DEFAULT_MAX_PENDING_CALLS
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            message_number_wrap: default_message_number_wrap(),
            max_pending_calls: default_max_pending_calls(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_message_number_wrap(self, message_number_wrap: u32) -> Self {
        DispatcherConfig {
            message_number_wrap,
            ..self
        }
    }

    pub fn with_max_pending_calls(self, max_pending_calls: usize) -> Self {
        DispatcherConfig {
            max_pending_calls,
            ..self
        }
    }
}

impl Configuration for DispatcherConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.message_number_wrap == 0 || self.message_number_wrap > MESSAGE_NUMBER_MASK {
            return Err(ConfigurationError::InvalidMessageNumberWrap {
                value: self.message_number_wrap,
                max: MESSAGE_NUMBER_MASK,
            });
        }

        if self.max_pending_calls == 0 {
            return Err(ConfigurationError::InvalidMaxPendingCalls);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// how long to wait for the transport's connected notification
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub connect_timeout: Option<Duration>,

    /// upper bound for unary and client-stream calls; no bound when unset
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_dispatcher(self, dispatcher: DispatcherConfig) -> Self {
        ClientConfig { dispatcher, ..self }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        ClientConfig {
            connect_timeout: Some(connect_timeout),
            ..self
        }
    }

    pub fn with_call_timeout(self, call_timeout: Duration) -> Self {
        ClientConfig {
            call_timeout: Some(call_timeout),
            ..self
        }
    }
}

impl Configuration for ClientConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.dispatcher.validate()?;

        if self.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigurationError::ZeroDuration("connect_timeout"));
        }
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigurationError::ZeroDuration("call_timeout"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// how long dispose waits for in-flight handlers to finish
    #[serde(
        default = "default_drain_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub drain_timeout: Duration,
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            dispatcher: DispatcherConfig::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn with_dispatcher(self, dispatcher: DispatcherConfig) -> Self {
        ServerConfig { dispatcher, ..self }
    }

    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        ServerConfig {
            drain_timeout,
            ..self
        }
    }
}

impl Configuration for ServerConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.dispatcher.validate()?;

        if self.drain_timeout.is_zero() {
            return Err(ConfigurationError::ZeroDuration("drain_timeout"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
        assert_eq!(
            DispatcherConfig::default().message_number_wrap,
            DEFAULT_MESSAGE_NUMBER_WRAP
        );
    }

    #[test]
    fn test_wrap_bounds() {
        let config = DispatcherConfig::default().with_message_number_wrap(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidMessageNumberWrap { value: 0, .. })
        ));

        let config = DispatcherConfig::default().with_message_number_wrap(MESSAGE_NUMBER_MASK + 1);
        assert!(config.validate().is_err());

        let config = DispatcherConfig::default().with_message_number_wrap(MESSAGE_NUMBER_MASK);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = DispatcherConfig::default().with_max_pending_calls(0);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidMaxPendingCalls)
        );

        let config = ClientConfig::default().with_call_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::ZeroDuration("call_timeout"))
        );

        let config = ServerConfig::default().with_drain_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_durations() {
        let config: ClientConfig =
            serde_yaml::from_str("connect_timeout: 1s\ncall_timeout: 250ms\n").unwrap();
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.dispatcher, DispatcherConfig::default());

        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }
}
