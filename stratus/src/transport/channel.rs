//! In-process transport for tests and single-machine clusters.
//!
//! The [`InMemoryHub`] routes envelopes to handler closures registered
//! per node, without touching the network. Tests script node behavior
//! (including communication failures) through the handlers and through
//! [`InMemoryHub::disconnect`], which makes a node unreachable exactly
//! the way a dead TCP peer would be.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::transport::message::{ClusterReply, RequestEnvelope};
use crate::transport::{NodeRef, Transport, TransportError, TransportFuture};

/// Future returned by a node handler.
pub type HandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<ClusterReply, TransportError>> + Send>>;

/// Behavior of one simulated node.
///
/// Receives the target node and the envelope; returns the reply the
/// node would put on the wire, or a scripted transport failure.
pub type NodeHandler = Arc<dyn Fn(NodeRef, RequestEnvelope) -> HandlerFuture + Send + Sync>;

/// In-memory message router implementing [`Transport`].
#[derive(Default)]
pub struct InMemoryHub {
    handlers: DashMap<NodeRef, NodeHandler>,
    down: DashMap<NodeRef, ()>,
}

impl InMemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a node.
    pub fn register(&self, node: NodeRef, handler: NodeHandler) {
        self.down.remove(&node);
        self.handlers.insert(node, handler);
    }

    /// Make a node unreachable. Requests to it fail with a
    /// communication error without invoking its handler.
    pub fn disconnect(&self, node: &NodeRef) {
        self.down.insert(node.clone(), ());
    }

    /// Restore a previously disconnected node.
    pub fn reconnect(&self, node: &NodeRef) {
        self.down.remove(node);
    }

    /// Whether a node is currently reachable.
    pub fn is_reachable(&self, node: &NodeRef) -> bool {
        self.handlers.contains_key(node) && !self.down.contains_key(node)
    }

    fn dispatch(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
    ) -> Result<(NodeHandler, NodeRef, RequestEnvelope), TransportError> {
        if self.down.contains_key(target) {
            return Err(TransportError::communication(target, "node is down"));
        }
        match self.handlers.get(target) {
            Some(handler) => Ok((handler.clone(), target.clone(), envelope)),
            None => Err(TransportError::communication(target, "unknown node")),
        }
    }
}

impl Transport for InMemoryHub {
    fn send(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
    ) -> TransportFuture<'_, Result<(), TransportError>> {
        let dispatched = self.dispatch(target, envelope);
        Box::pin(async move {
            let (handler, node, envelope) = dispatched?;
            // Fire-and-forget: the reply (or remote error) is discarded.
            let _ = handler(node, envelope).await;
            Ok(())
        })
    }

    fn request(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> TransportFuture<'_, Result<ClusterReply, TransportError>> {
        let dispatched = self.dispatch(target, envelope);
        let target = target.clone();
        Box::pin(async move {
            let (handler, node, envelope) = dispatched?;
            let reply = tokio::time::timeout(timeout, handler(node, envelope))
                .await
                .map_err(|_| TransportError::Timeout {
                    node: target.to_string(),
                    timeout,
                })??;
            match reply {
                ClusterReply::Error(info) => Err(TransportError::Remote {
                    node: target.to_string(),
                    info,
                }),
                reply => Ok(reply),
            }
        })
    }
}
