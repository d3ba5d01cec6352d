//! Config loading and persistence.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Limits;
use crate::engine::resolver::EndpointPreference;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    /// Which endpoint wins when an edge's source and target sit on
    /// different days and no explicit day is given.
    pub edge_day_preference: EndpointPreference,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            edge_day_preference: EndpointPreference::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for the built-in keyed-digest verifier. Deployments
    /// with a real issuer replace the verifier and ignore this.
    pub shared_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret: "dev-secret-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stderr: bool,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stderr: true,
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(crate::daemon::ipc::IpcError::Io)?;
        let config = serde_json::from_str(&raw)
            .map_err(crate::daemon::ipc::IpcError::Decode)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(crate::daemon::ipc::IpcError::Io)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(crate::daemon::ipc::IpcError::Encode)?;
        fs::write(path, raw).map_err(crate::daemon::ipc::IpcError::Io)?;
        Ok(())
    }
}
