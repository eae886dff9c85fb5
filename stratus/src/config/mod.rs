//! Controller configuration.
//!
//! [`Settings`] is an immutable snapshot of process-wide options. The
//! global instance is published copy-on-write behind a lock, so readers
//! never observe torn state. Resolution order: explicit setter >
//! app-config file > built-in defaults.

pub mod file;
pub mod settings;

pub use file::{load_app_config, AppConfig, ConfigFileError};
pub use settings::{Settings, SettingsHandle};

/// Subdirectories of the working directory recreated on startup.
pub const WORKING_SUBDIRS: [&str; 3] = ["assembly-cache", "local-cache", "dependency-stage"];
