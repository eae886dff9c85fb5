//! Master-failover request dispatch.
//!
//! The [`FailoverDispatcher`] sends a request to whichever node is
//! currently master and transparently fails over to the alternates on
//! communication failures. After exhausting every target it probes all
//! of them for fresh membership and retries once against the adopted
//! view.
//!
//! Retry policy: only communication failures and timeouts move the
//! dispatcher to the next target. A remote error means the cluster is
//! reachable and the failure is semantic: it propagates to the caller
//! untouched and the view is left unchanged. Requests are safe to
//! re-send because every envelope carries a `(client_id, request_id)`
//! tuple the cluster-side handler deduplicates on.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::view::ClusterView;
use crate::error::ControllerError;
use crate::transport::message::{ClusterReply, ClusterRequest, RequestEnvelope};
use crate::transport::{NodeRef, Transport, TransportError};

/// Timeout for each membership probe during failover.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reply to a dispatched request, with the view adopted during
/// failover when one was.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The node's reply.
    pub reply: ClusterReply,
    /// The node that produced the reply. When this is not the
    /// pre-state master, the caller should reconcile its membership
    /// view.
    pub responder: NodeRef,
    /// Membership adopted from a failover probe, if the dispatch had to
    /// re-query the cluster. `None` when the pre-state view answered.
    pub updated_view: Option<ClusterView>,
}

/// Sends requests to the current master with failover across
/// alternates.
pub struct FailoverDispatcher {
    transport: Arc<dyn Transport>,
    client_id: Uuid,
    attempt_timeout: Duration,
    probe_timeout: Duration,
}

impl FailoverDispatcher {
    /// Create a dispatcher.
    ///
    /// `attempt_timeout` bounds each per-target send; membership probes
    /// use a shorter fixed timeout.
    pub fn new(transport: Arc<dyn Transport>, client_id: Uuid, attempt_timeout: Duration) -> Self {
        Self {
            transport,
            client_id,
            attempt_timeout,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Override the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Send `request` to one specific node, without failover.
    ///
    /// Used where the protocol addresses a node directly: boot-time
    /// candidate probing and detaching a worker.
    pub async fn request_direct(
        &self,
        target: &NodeRef,
        request: ClusterRequest,
    ) -> Result<ClusterReply, ControllerError> {
        let envelope = RequestEnvelope::new(self.client_id, request);
        self.transport
            .request(target, envelope, self.attempt_timeout)
            .await
            .map_err(ControllerError::from)
    }

    /// Dispatch `request` against `view`.
    ///
    /// Returns the reply and the view adopted during failover, if any.
    /// Fails `NoMaster` when the view has no targets and
    /// `ClusterUnreachable` when every target and every probe failed.
    pub async fn dispatch(
        &self,
        view: &ClusterView,
        request: ClusterRequest,
    ) -> Result<DispatchOutcome, ControllerError> {
        // One envelope for the whole dispatch: retries reuse the
        // request id so the cluster can deduplicate deliveries.
        let envelope = RequestEnvelope::new(self.client_id, request);

        let mut current = view.clone();
        let mut adopted: Option<ClusterView> = None;

        for round in 0..2 {
            let targets = current.ordered_targets();
            if targets.is_empty() {
                return Err(ControllerError::NoMaster);
            }

            for target in &targets {
                match self
                    .transport
                    .request(target, envelope.clone(), self.attempt_timeout)
                    .await
                {
                    Ok(reply) => {
                        debug!(
                            node = %target,
                            request = envelope.request.name(),
                            round,
                            "dispatch succeeded"
                        );
                        return Ok(DispatchOutcome {
                            reply,
                            responder: target.clone(),
                            updated_view: adopted,
                        });
                    }
                    Err(TransportError::Remote { info, .. }) => {
                        // The cluster answered; the failure is semantic.
                        return Err(ControllerError::Remote(info));
                    }
                    Err(err) => {
                        warn!(
                            node = %target,
                            request = envelope.request.name(),
                            error = %err,
                            "dispatch attempt failed, trying next target"
                        );
                    }
                }
            }

            if round == 1 {
                break;
            }

            // Every target failed. Probe all of them for membership and
            // retry once against whichever answers first.
            match self.probe_membership(&targets, &current).await {
                Some(fresh) => {
                    debug!(
                        master = ?fresh.master,
                        alts = fresh.alts.len(),
                        "adopted membership from failover probe"
                    );
                    adopted = Some(fresh.clone());
                    current = fresh;
                }
                None => break,
            }
        }

        Err(ControllerError::ClusterUnreachable)
    }

    /// Probe every target for membership in parallel; the first
    /// successful reply wins and later replies are discarded.
    async fn probe_membership(
        &self,
        targets: &[NodeRef],
        previous: &ClusterView,
    ) -> Option<ClusterView> {
        let probes = targets.iter().map(|target| {
            let envelope =
                RequestEnvelope::new(self.client_id, ClusterRequest::GetAllNodes);
            let target = target.clone();
            Box::pin(async move {
                match self
                    .transport
                    .request(&target, envelope, self.probe_timeout)
                    .await
                {
                    Ok(ClusterReply::Nodes(nodes)) => Ok(nodes),
                    Ok(other) => {
                        warn!(node = %target, reply = ?other, "unexpected probe reply");
                        Err(())
                    }
                    Err(err) => {
                        warn!(node = %target, error = %err, "membership probe failed");
                        Err(())
                    }
                }
            })
        });

        let nodes = match futures::future::select_ok(probes).await {
            Ok((nodes, _rest)) => nodes,
            Err(()) => return None,
        };

        match ClusterView::from_membership(previous, &nodes) {
            Ok(view) => Some(view),
            Err(err) => {
                warn!(error = %err, "probe returned unusable membership");
                None
            }
        }
    }
}
