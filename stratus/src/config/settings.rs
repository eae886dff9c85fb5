//! Process-wide controller settings.
//!
//! A [`Settings`] value is an immutable snapshot. The process-wide
//! instance lives behind a [`SettingsHandle`]: reads hand out the
//! current `Arc<Settings>` snapshot, writes publish a whole new
//! snapshot under a lock. Readers never see torn state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use uuid::Uuid;

use crate::config::file::{load_app_config, AppConfig};
use crate::config::WORKING_SUBDIRS;
use crate::error::ControllerError;
use crate::store::{StoreDescriptor, StoreRegistry};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable snapshot of controller configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Identity of this controller, assigned when the snapshot is
    /// first materialized.
    pub client_id: Uuid,
    /// Per-request timeout used by the dispatcher.
    pub default_timeout: Duration,
    /// Client scratch directory.
    pub working_directory: PathBuf,
    /// Path to the `stratusd` executable for spawning local nodes.
    pub stratusd_path: Option<PathBuf>,
    /// Default store for deployments that do not name one.
    pub default_store: StoreDescriptor,
}

impl Settings {
    /// Built-in defaults with a fresh client id.
    pub fn defaults() -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            default_timeout: DEFAULT_TIMEOUT,
            working_directory: std::env::temp_dir().join(format!("stratus-{client_id}")),
            stratusd_path: None,
            default_store: StoreDescriptor::LocalFs {
                root: std::env::temp_dir().join("stratus-store"),
            },
        }
    }

    /// Overlay app-config values onto the defaults.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, ControllerError> {
        let mut settings = Self::defaults();
        if let Some(path) = &config.stratusd_path {
            settings.stratusd_path = Some(path.clone());
        }
        if let Some(dir) = &config.working_directory {
            settings.working_directory = dir.clone();
        }
        if let Some(provider) = &config.store_provider {
            settings.default_store =
                StoreDescriptor::from_config(provider, config.store_endpoint.as_deref())?;
        }
        Ok(settings)
    }

    /// Load from an app-config file, falling back to defaults when the
    /// file is absent.
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let config =
            load_app_config(path).map_err(|e| ControllerError::Configuration(e.to_string()))?;
        Self::from_app_config(&config)
    }

    /// Recreate the working directory layout. Existing content is left
    /// in place.
    pub fn prepare_working_directory(&self) -> Result<(), ControllerError> {
        for subdir in WORKING_SUBDIRS {
            let path = self.working_directory.join(subdir);
            std::fs::create_dir_all(&path).map_err(|e| {
                ControllerError::Configuration(format!(
                    "cannot create working directory {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(())
    }
}

/// Copy-on-write access to a shared [`Settings`] snapshot.
pub struct SettingsHandle {
    inner: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    /// Create a handle over an initial snapshot.
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(Arc::new(settings)),
        }
    }

    /// The process-wide handle, materialized from the default
    /// app-config location (`~/.stratus/config.ini`) on first access.
    pub fn global() -> &'static SettingsHandle {
        static GLOBAL: OnceLock<SettingsHandle> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let path = std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".stratus").join("config.ini"))
                .unwrap_or_else(|| PathBuf::from("stratus-config.ini"));
            let settings = Settings::load(&path).unwrap_or_else(|_| Settings::defaults());
            SettingsHandle::new(settings)
        })
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<Settings> {
        self.inner
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    /// Publish a modified snapshot.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    /// Set the default store provider.
    ///
    /// The store is activated in the process-wide registry before the
    /// new snapshot becomes visible to readers.
    pub fn set_default_store(&self, descriptor: StoreDescriptor) {
        StoreRegistry::global().activate(descriptor.clone());
        self.update(|settings| settings.default_store = descriptor);
    }
}
