//! Session configuration and JSON loading.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::CodecRole;
use crate::element::CodecElement;
use crate::error::ConfigError;

/// Configuration for opening one codec session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Driver component name, e.g. `OMX.vendor.video.decoder.avc`.
    pub component: String,
    pub role: CodecRole,
    /// Upper bound on lifecycle command waits in milliseconds. `None`
    /// waits as long as the driver takes. Buffer waits are never bounded.
    pub command_timeout_ms: Option<u64>,
    pub element: CodecElement,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            component: String::new(),
            role: CodecRole::Decoder,
            command_timeout_ms: None,
            element: CodecElement::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(component: impl Into<String>, role: CodecRole) -> Self {
        Self {
            component: component.into(),
            role,
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Deserialize and validate a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        debug!(
            component = %config.component,
            role = ?config.role,
            "Deserialized session config"
        );
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        info!(
            component = %config.component,
            path = %path.display(),
            "Session config loaded"
        );
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.component.is_empty() {
            return Err(ConfigError::Invalid("component name is empty".into()));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "command timeout must be > 0 when set".into(),
            ));
        }
        self.element.validate().map_err(ConfigError::Invalid)
    }
}
