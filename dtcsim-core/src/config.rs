//! On-disk configuration schema for a [`crate::router::Router`]: the
//! starting network profile, idle-session timeout, and TCP reject list.
//! JSON and YAML are both accepted, dispatched by file extension.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::profile::NetworkProfile;

fn default_idle_timeout_ms() -> i64 {
    300_000
}

fn default_reject_ports() -> HashSet<u16> {
    crate::context::RejectList::default_ports()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub tun_addr: Ipv4Addr,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
    #[serde(default)]
    pub profile: NetworkProfile,
    #[serde(default = "default_reject_ports")]
    pub reject_ports: HashSet<u16>,
}

#[cfg(feature = "config-loader")]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported config file extension: {0}")]
    UnsupportedExtension(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(feature = "config-loader")]
impl RouterConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads a config from `path`, picking JSON or YAML by its extension.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            other => Err(ConfigError::UnsupportedExtension(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}
