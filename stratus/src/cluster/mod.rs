//! Cluster membership, failover dispatch and cached metadata.

pub mod dispatch;
pub mod metadata;
pub mod view;

pub use dispatch::{DispatchOutcome, FailoverDispatcher};
pub use metadata::{Cached, CachedMetadata, DEFAULT_METADATA_TTL};
pub use view::{
    BootConfiguration, ClusterView, NodeInfo, NodePermissions, NodeRole, ViewError,
};
