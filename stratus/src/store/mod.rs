//! Store capability interface.
//!
//! The controller consumes storage backends, it does not provide one.
//! A [`StoreDescriptor`] names a backend; activating it through the
//! process-wide [`StoreRegistry`] yields an opaque [`StoreInfo`]
//! capability that deployments are bound to via [`StoreId`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Stable identifier of an activated store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    /// Identifier for a local filesystem store rooted at `path`.
    pub fn local_fs(path: impl AsRef<Path>) -> Self {
        StoreId(format!("fs:{}", path.as_ref().display()))
    }

    /// Identifier for a blob endpoint store.
    pub fn blob(endpoint: &str, container: &str) -> Self {
        StoreId(format!("blob:{endpoint}/{container}"))
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of a storage backend the controller can activate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreDescriptor {
    /// Directory on a filesystem reachable by every node.
    LocalFs { root: PathBuf },
    /// Remote blob store endpoint.
    Blob { endpoint: String, container: String },
}

impl StoreDescriptor {
    /// The identifier this descriptor activates under.
    pub fn id(&self) -> StoreId {
        match self {
            StoreDescriptor::LocalFs { root } => StoreId::local_fs(root),
            StoreDescriptor::Blob {
                endpoint,
                container,
            } => StoreId::blob(endpoint, container),
        }
    }

    /// Parse a provider name plus optional endpoint, as found in the
    /// app-config (`store-provider` / `store-endpoint` keys).
    pub fn from_config(provider: &str, endpoint: Option<&str>) -> Result<Self, ControllerError> {
        match provider.to_lowercase().as_str() {
            "local-fs" | "localfs" | "fs" => {
                let root = endpoint
                    .map(PathBuf::from)
                    .unwrap_or_else(|| std::env::temp_dir().join("stratus-store"));
                Ok(StoreDescriptor::LocalFs { root })
            }
            "blob" => {
                let endpoint = endpoint.ok_or_else(|| {
                    ControllerError::Configuration(
                        "store-provider 'blob' requires store-endpoint".into(),
                    )
                })?;
                let (endpoint, container) = match endpoint.rsplit_once('/') {
                    Some((endpoint, container)) if !container.is_empty() => {
                        (endpoint.to_string(), container.to_string())
                    }
                    _ => (endpoint.to_string(), "stratus".to_string()),
                };
                Ok(StoreDescriptor::Blob {
                    endpoint,
                    container,
                })
            }
            other => Err(ControllerError::Configuration(format!(
                "unknown store provider '{other}'"
            ))),
        }
    }
}

/// Opaque capability handle to an activated store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// The store's identifier.
    pub id: StoreId,
    /// The descriptor it was activated from.
    pub descriptor: StoreDescriptor,
}

/// Process-wide registry of activated stores.
///
/// Activation is idempotent: re-activating a descriptor returns the
/// existing capability.
pub struct StoreRegistry {
    stores: DashMap<StoreId, StoreInfo>,
}

impl StoreRegistry {
    fn new() -> Self {
        Self {
            stores: DashMap::new(),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static StoreRegistry {
        static REGISTRY: OnceLock<StoreRegistry> = OnceLock::new();
        REGISTRY.get_or_init(StoreRegistry::new)
    }

    /// Activate a store, registering it if necessary.
    pub fn activate(&self, descriptor: StoreDescriptor) -> StoreInfo {
        let id = descriptor.id();
        self.stores
            .entry(id.clone())
            .or_insert_with(|| StoreInfo { id, descriptor })
            .clone()
    }

    /// Look up an activated store by id.
    pub fn try_get(&self, id: &StoreId) -> Option<StoreInfo> {
        self.stores.get(id).map(|entry| entry.clone())
    }
}
