use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::surface::preferences::Preferences;
use crate::window_open::Disposition;

const CONFIG_ENV: &str = "FRONTIER_HOST_CONFIG";
const CONFIG_FILE: &str = "host.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read host config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Preferences of the root top-level surface created by the host binary.
    pub root_preferences: Preferences,
    pub window_open: WindowOpenConfig,
    /// JSON-lines audit report; auditing is off when unset.
    pub audit_report: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_filter: String::from("info"),
            root_preferences: Preferences::default(),
            window_open: WindowOpenConfig::default(),
            audit_report: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowOpenConfig {
    pub allowed_dispositions: Vec<Disposition>,
}

impl Default for WindowOpenConfig {
    fn default() -> Self {
        Self {
            allowed_dispositions: vec![
                Disposition::ForegroundTab,
                Disposition::NewWindow,
                Disposition::BackgroundTab,
            ],
        }
    }
}

impl HostConfig {
    /// Load from `path`, or fall back to defaults when no file exists there.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(&path)?;
                if contents.trim().is_empty() {
                    return Ok(Self::default());
                }
                Ok(serde_yaml::from_str(&contents)?)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::load(path)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "frontier", "frontier-host")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}
