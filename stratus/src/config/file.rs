//! App-config file parsing.
//!
//! The controller reads an optional INI file with a single
//! `[controller]` section. Recognized keys:
//!
//! - `stratusd-path`: path to the worker daemon executable
//! - `working-directory`: client scratch directory
//! - `store-provider`: default store provider (`local-fs`, `blob`)
//! - `store-endpoint`: provider-specific endpoint or root path

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

/// Errors loading the app-config file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// The file exists but could not be read or parsed.
    #[error("failed to parse config file {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    /// A key held a value of the wrong shape.
    #[error("invalid value for controller.{key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Values found in the app-config file. All optional; absent keys fall
/// back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// `controller.stratusd-path`
    pub stratusd_path: Option<PathBuf>,
    /// `controller.working-directory`
    pub working_directory: Option<PathBuf>,
    /// `controller.store-provider`
    pub store_provider: Option<String>,
    /// `controller.store-endpoint`
    pub store_endpoint: Option<String>,
}

/// Load the app-config from `path`.
///
/// A missing file is not an error: it yields the empty config.
pub fn load_app_config(path: &Path) -> Result<AppConfig, ConfigFileError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let ini = Ini::load_from_file(path).map_err(|e| ConfigFileError::ParseError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut config = AppConfig::default();
    if let Some(section) = ini.section(Some("controller")) {
        if let Some(v) = section.get("stratusd-path") {
            let v = v.trim();
            if !v.is_empty() {
                config.stratusd_path = Some(expand_tilde(v));
            }
        }
        if let Some(v) = section.get("working-directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.working_directory = Some(expand_tilde(v));
            }
        }
        if let Some(v) = section.get("store-provider") {
            let v = v.trim().to_lowercase();
            if !v.is_empty() {
                if !matches!(v.as_str(), "local-fs" | "localfs" | "fs" | "blob") {
                    return Err(ConfigFileError::InvalidValue {
                        key: "store-provider".into(),
                        reason: format!("unknown provider '{v}'"),
                    });
                }
                config.store_provider = Some(v);
            }
        }
        if let Some(v) = section.get("store-endpoint") {
            let v = v.trim();
            if !v.is_empty() {
                config.store_endpoint = Some(v.to_string());
            }
        }
    }

    Ok(config)
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(value)
}
