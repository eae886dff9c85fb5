//! Stratus - client-side controller for distributed compute clusters
//!
//! This library connects to, boots and administers a multi-node stratus
//! cluster, and submits user-defined cloud processes to it. Requests
//! are routed to whichever node is currently master, with transparent
//! failover across replicated alternates.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides the controller
//! facade:
//!
//! ```ignore
//! use stratus::service::StratusCluster;
//! use stratus::transport::TcpTransport;
//!
//! let transport = Arc::new(TcpTransport::new());
//! let cluster = StratusCluster::connect(transport, &seeds).await?;
//!
//! let handle = cluster.submit(&computation, "u64", deps).await?;
//! let result: u64 = handle.await_result_as(None).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod local;
pub mod logging;
pub mod package;
pub mod process;
pub mod runtime;
pub mod service;
pub mod store;
pub mod transport;

pub use error::{ControllerError, RemoteErrorInfo};
pub use service::StratusCluster;

/// Version of the stratus library.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
