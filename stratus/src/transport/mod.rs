//! Node addressing and the request/reply transport abstraction.
//!
//! A [`NodeRef`] is an immutable, comparable handle to a remote cluster
//! node. The [`Transport`] trait is the only way the controller talks to
//! nodes; higher layers (dispatcher, proxy) never see sockets or frames.
//!
//! # Error classification
//!
//! Transport failures are classified into three kinds and the
//! classification must survive every layer, because the failover
//! dispatcher's retry decision depends on it:
//!
//! - [`TransportError::Communication`]: delivery failed; retryable.
//! - [`TransportError::Timeout`]: no reply within deadline; retryable.
//! - [`TransportError::Remote`]: the node handled the message and
//!   returned an error; propagated verbatim, never retried.
//!
//! # Implementations
//!
//! - [`InMemoryHub`](channel::InMemoryHub): in-process routing for
//!   tests and single-machine setups
//! - [`TcpTransport`](tcp::TcpTransport): pooled TCP connections with
//!   length-delimited frames

pub mod channel;
pub mod message;
pub mod tcp;

pub use channel::{InMemoryHub, NodeHandler};
pub use message::{
    ClusterDeploymentInfo, ClusterReply, ClusterRequest, LogEntry, LogLevel,
    NodeDeploymentInfo, PerformanceCounters, RequestEnvelope,
};
pub use tcp::TcpTransport;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ControllerError, RemoteErrorInfo};

/// Boxed future type used throughout the transport layer.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// NodeRef
// =============================================================================

/// Addressable handle to a remote cluster node.
///
/// Combines the node's transport address with its logical id. Values are
/// cheap to clone and may be held freely by any component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Logical node identifier, stable across reconnects.
    id: String,
    /// Transport address the node listens on.
    addr: SocketAddr,
}

impl NodeRef {
    /// Create a node reference from a logical id and address.
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }

    /// The node's logical identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node's transport address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URI form used in deployment info reports.
    pub fn uri(&self) -> String {
        format!("stratus://{}", self.addr)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Transport-level failure, classified for the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The message could not be delivered or the connection was lost.
    #[error("communication failure with {node}: {reason}")]
    Communication { node: String, reason: String },

    /// No reply arrived before the per-attempt deadline.
    #[error("request to {node} timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    /// The remote side handled the message but returned an error.
    /// The payload is preserved verbatim.
    #[error("remote error from {node}: {info}")]
    Remote { node: String, info: RemoteErrorInfo },
}

impl TransportError {
    /// Build a communication error for a target node.
    pub fn communication(node: &NodeRef, reason: impl Into<String>) -> Self {
        Self::Communication {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the dispatcher may retry this failure on another target.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Remote { .. })
    }
}

impl From<TransportError> for ControllerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Communication { node, reason } => {
                ControllerError::Communication(format!("{node}: {reason}"))
            }
            TransportError::Timeout { .. } => ControllerError::Timeout,
            TransportError::Remote { info, .. } => ControllerError::Remote(info),
        }
    }
}

// =============================================================================
// Transport trait
// =============================================================================

/// Typed request/reply channel to cluster nodes.
///
/// Implementations own connection management; callers address nodes by
/// [`NodeRef`] only. All methods are object-safe so the controller can
/// hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget delivery. Errors only when the message could not
    /// be handed to the wire; no reply is awaited.
    fn send(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
    ) -> TransportFuture<'_, Result<(), TransportError>>;

    /// Send a request and await the typed reply within `timeout`.
    ///
    /// A decoded error reply surfaces as [`TransportError::Remote`];
    /// the `Ok` arm always carries a non-error [`ClusterReply`].
    fn request(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> TransportFuture<'_, Result<ClusterReply, TransportError>>;
}
