//! Binder settings file: broker list plus named bindings
//!
//! ```yaml
//! brokers: localhost:9092
//! group: order-service
//! bindings:
//!   orders-in:
//!     destination: orders
//!     consumer:
//!       enableDlq: true
//!       maxAttempts: 3
//!       onFatal: stop
//! ```

use crate::consumer::config::{BindingConfig, BindingConsumerPolicy};
use crate::consumer::converter::ConverterRegistry;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Environment variable overriding `brokers`
pub const BROKERS_ENV: &str = "KAFKA_BINDER_BROKERS";

/// One named binding as written in the settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingProperties {
    pub destination: String,
    /// Falls back to the binder-level group
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub consumer: BindingConsumerPolicy,
}

/// Top-level settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinderConfig {
    pub brokers: String,
    /// Default consumer group for bindings that do not set one
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub bindings: BTreeMap<String, BindingProperties>,
}

impl BinderConfig {
    /// Read a YAML settings file, applying the broker override from the environment
    pub fn load(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConsumerError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&contents)?;
        if let Ok(brokers) = std::env::var(BROKERS_ENV) {
            debug!(brokers = %brokers, "Broker list overridden from environment");
            config.brokers = brokers;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> ConsumerResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConsumerError::ConfigError(format!("invalid binder settings: {}", e)))
    }

    fn validate(&self) -> ConsumerResult<()> {
        if self.brokers.trim().is_empty() {
            return Err(ConsumerError::ConfigError("brokers cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Names of every configured binding
    pub fn binding_names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Resolve a named binding into its validated configuration
    pub fn binding(&self, name: &str, converters: &ConverterRegistry) -> ConsumerResult<BindingConfig> {
        let properties = self
            .bindings
            .get(name)
            .ok_or_else(|| ConsumerError::ConfigError(format!("no binding named '{}'", name)))?;

        let group = properties
            .group
            .as_ref()
            .or(self.group.as_ref())
            .ok_or_else(|| {
                ConsumerError::ConfigError(format!("binding '{}' has no consumer group", name))
            })?;

        BindingConfig::resolve(
            name,
            &properties.destination,
            group,
            properties.consumer.clone(),
            converters,
        )
    }
}
