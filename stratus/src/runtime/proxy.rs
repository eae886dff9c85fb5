//! Runtime proxy: the single writer of the cluster view.
//!
//! The [`ProxyDaemon`] is a long-running background task owning the
//! mutable [`ClusterView`]. Every cluster-facing request from the rest
//! of the controller goes through its mailbox, so view replacements are
//! serialized: the view seen by message *n+1* reflects any update
//! produced by message *n*. This is the sole serialization point in the
//! client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ProxyDaemon                           │
//! │                                                              │
//! │  ProxyMessage ──► ┌──────────────┐     ┌──────────────────┐  │
//! │  (mailbox)        │ GetLastView  │──►  │ reply with view  │  │
//! │                   ├──────────────┤     └──────────────────┘  │
//! │                   │ Remote(m)    │──►  FailoverDispatcher    │
//! │                   │              │     then view ← view'     │
//! │                   ├──────────────┤                           │
//! │                   │ Terminate    │──►  drain, stop           │
//! │                   └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers hold a cheap [`ProxyClient`] handle; the daemon exits when
//! the shutdown token fires, a `Terminate` message arrives, or every
//! client has been dropped.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::dispatch::FailoverDispatcher;
use crate::cluster::view::{BootConfiguration, ClusterView, NodeInfo, NodeRole};
use crate::error::ControllerError;
use crate::transport::message::{ClusterReply, ClusterRequest};
use crate::transport::NodeRef;

/// Mailbox capacity of the proxy daemon.
const MAILBOX_CAPACITY: usize = 64;

/// Messages accepted by the proxy daemon.
pub enum ProxyMessage {
    /// Dispatch a request to the cluster and forward the reply.
    Remote {
        request: ClusterRequest,
        reply_to: oneshot::Sender<Result<ClusterReply, ControllerError>>,
    },
    /// Local query for the current view. Never touches the network.
    GetLastView {
        reply_to: oneshot::Sender<ClusterView>,
    },
    /// Stop the daemon; queued requests are answered `Cancelled`.
    Terminate,
}

/// Cloneable handle for submitting messages to the proxy daemon.
#[derive(Clone)]
pub struct ProxyClient {
    tx: mpsc::Sender<ProxyMessage>,
}

impl ProxyClient {
    /// Dispatch a request to the cluster through the proxy.
    pub async fn request(&self, request: ClusterRequest) -> Result<ClusterReply, ControllerError> {
        let (reply_to, rx) = oneshot::channel();
        self.tx
            .send(ProxyMessage::Remote { request, reply_to })
            .await
            .map_err(|_| ControllerError::Disposed)?;
        rx.await.map_err(|_| ControllerError::Cancelled)?
    }

    /// Read the proxy's current view without touching the network.
    pub async fn last_view(&self) -> Result<ClusterView, ControllerError> {
        let (reply_to, rx) = oneshot::channel();
        self.tx
            .send(ProxyMessage::GetLastView { reply_to })
            .await
            .map_err(|_| ControllerError::Disposed)?;
        rx.await.map_err(|_| ControllerError::Disposed)
    }

    /// Ask the daemon to stop. Queued requests are cancelled.
    pub async fn terminate(&self) {
        let _ = self.tx.send(ProxyMessage::Terminate).await;
    }

    /// Whether the daemon is still accepting messages.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The proxy daemon. Owns the view; runs as a background task.
pub struct ProxyDaemon {
    view: ClusterView,
    dispatcher: FailoverDispatcher,
    mailbox: mpsc::Receiver<ProxyMessage>,
}

impl ProxyDaemon {
    /// Create a daemon with its client handle.
    pub fn new(view: ClusterView, dispatcher: FailoverDispatcher) -> (Self, ProxyClient) {
        let (tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        (
            Self {
                view,
                dispatcher,
                mailbox,
            },
            ProxyClient { tx },
        )
    }

    /// Run until shutdown, termination, or the last client drops.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("runtime proxy starting");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("runtime proxy shutting down");
                    break;
                }

                msg = self.mailbox.recv() => match msg {
                    None => {
                        debug!("all proxy clients dropped, stopping");
                        break;
                    }
                    Some(ProxyMessage::GetLastView { reply_to }) => {
                        let _ = reply_to.send(self.view.clone());
                    }
                    Some(ProxyMessage::Remote { request, reply_to }) => {
                        let result = self.handle_remote(request).await;
                        let _ = reply_to.send(result);
                    }
                    Some(ProxyMessage::Terminate) => {
                        info!("runtime proxy terminating");
                        break;
                    }
                },
            }
        }

        self.drain();
    }

    /// Answer every queued message without touching the network.
    fn drain(&mut self) {
        self.mailbox.close();
        while let Ok(msg) = self.mailbox.try_recv() {
            match msg {
                ProxyMessage::Remote { reply_to, .. } => {
                    let _ = reply_to.send(Err(ControllerError::Cancelled));
                }
                // Dropping the sender signals cancellation to the caller.
                ProxyMessage::GetLastView { .. } | ProxyMessage::Terminate => {}
            }
        }
    }

    async fn handle_remote(
        &mut self,
        request: ClusterRequest,
    ) -> Result<ClusterReply, ControllerError> {
        match request {
            ClusterRequest::MasterBoot(cfg) => self.handle_boot(cfg).await,
            request => self.handle_dispatch(request).await,
        }
    }

    /// Ordinary request: dispatch with failover, then install whatever
    /// view the dispatch produced before the next mailbox item.
    async fn handle_dispatch(
        &mut self,
        request: ClusterRequest,
    ) -> Result<ClusterReply, ControllerError> {
        let outcome = self.dispatcher.dispatch(&self.view, request.clone()).await?;
        if let Some(updated) = outcome.updated_view {
            debug!(master = ?updated.master, "installing view adopted during failover");
            self.view = updated;
        }
        self.apply_reply_effects(&request, &outcome.reply);

        // An answer from a node other than the believed master means
        // the master line-up moved underneath us. Reconcile before the
        // next mailbox item.
        let answered_by_master = self.view.master.as_ref() == Some(&outcome.responder);
        if self.view.is_booted()
            && !answered_by_master
            && !matches!(request, ClusterRequest::GetAllNodes)
        {
            match self
                .dispatcher
                .request_direct(&outcome.responder, ClusterRequest::GetAllNodes)
                .await
            {
                Ok(ClusterReply::Nodes(nodes)) => {
                    match ClusterView::from_membership(&self.view, &nodes) {
                        Ok(view) => {
                            debug!(master = ?view.master, "reconciled view after off-master reply");
                            self.view = view;
                        }
                        Err(err) => {
                            warn!(error = %err, "ignoring unusable membership report")
                        }
                    }
                }
                Ok(other) => {
                    warn!(reply = ?other, "unexpected reply while reconciling membership")
                }
                Err(err) => {
                    warn!(error = %err, "membership reconciliation failed")
                }
            }
        }
        Ok(outcome.reply)
    }

    /// Reconcile the view after a successful reply.
    fn apply_reply_effects(&mut self, request: &ClusterRequest, reply: &ClusterReply) {
        match (request, reply) {
            // A membership report from the cluster is authoritative.
            (ClusterRequest::GetAllNodes, ClusterReply::Nodes(nodes)) => {
                if self.view.is_booted() {
                    match ClusterView::from_membership(&self.view, nodes) {
                        Ok(view) => self.view = view,
                        Err(err) => {
                            warn!(error = %err, "ignoring unusable membership report")
                        }
                    }
                }
            }
            (ClusterRequest::Attach(node), ClusterReply::Ack) => {
                self.view.workers.insert(node.clone());
            }
            // Shutdown is the only operation that resets the
            // deployment id to zero.
            (ClusterRequest::ShutdownSync, ClusterReply::Ack) => {
                self.view = ClusterView::unbooted(self.view.store_id.clone());
            }
            _ => {}
        }
    }

    /// Boot a deployment from scratch.
    ///
    /// Probes the configured nodes for their permissions, selects the
    /// master candidates, boots the first that accepts, then installs
    /// the canonical membership reported by the new master.
    async fn handle_boot(
        &mut self,
        cfg: BootConfiguration,
    ) -> Result<ClusterReply, ControllerError> {
        if self.view.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is already active".into(),
            ));
        }

        let mut infos: Vec<NodeInfo> = Vec::with_capacity(cfg.nodes.len());
        for node in &cfg.nodes {
            match self
                .dispatcher
                .request_direct(node, ClusterRequest::GetNodeDeploymentInfo { with_perf: false })
                .await
            {
                Ok(ClusterReply::NodeInfo(info)) => infos.push(info.node),
                Ok(other) => {
                    warn!(node = %node, reply = ?other, "unexpected reply to boot probe")
                }
                Err(err) => {
                    warn!(node = %node, error = %err, "boot probe failed, skipping node")
                }
            }
        }

        let candidates = ClusterView::candidates_for_master(&infos);
        if candidates.is_empty() {
            return Err(ControllerError::Precondition(
                "no eligible master candidate among the configured nodes".into(),
            ));
        }

        for candidate in &candidates {
            match self
                .dispatcher
                .request_direct(candidate, ClusterRequest::MasterBoot(cfg.clone()))
                .await
            {
                Ok(ClusterReply::Booted {
                    deployment_id,
                    master,
                    alts,
                }) => {
                    let view = self
                        .canonical_view(&cfg, deployment_id, master.clone(), alts.clone())
                        .await?;
                    info!(
                        deployment = %deployment_id,
                        master = %master,
                        alts = alts.len(),
                        workers = view.workers.len(),
                        "cluster booted"
                    );
                    self.view = view;
                    return Ok(ClusterReply::Booted {
                        deployment_id,
                        master,
                        alts,
                    });
                }
                Ok(other) => {
                    warn!(node = %candidate, reply = ?other, "unexpected reply to MasterBoot")
                }
                Err(ControllerError::Remote(info)) => return Err(ControllerError::Remote(info)),
                Err(err) => {
                    warn!(node = %candidate, error = %err, "boot attempt failed, trying next candidate")
                }
            }
        }

        Err(ControllerError::ClusterUnreachable)
    }

    /// Query the freshly booted master for membership and assemble the
    /// canonical view.
    async fn canonical_view(
        &self,
        cfg: &BootConfiguration,
        deployment_id: Uuid,
        master: NodeRef,
        alts: Vec<NodeRef>,
    ) -> Result<ClusterView, ControllerError> {
        let workers = match self
            .dispatcher
            .request_direct(&master, ClusterRequest::GetAllNodes)
            .await?
        {
            ClusterReply::Nodes(nodes) => nodes
                .iter()
                .filter(|n| n.role == NodeRole::Worker)
                .map(|n| n.node.clone())
                .collect(),
            other => {
                return Err(ControllerError::Communication(format!(
                    "new master returned unexpected reply to GetAllNodes: {other:?}"
                )))
            }
        };

        let store_id = cfg
            .store_id
            .clone()
            .unwrap_or_else(|| self.view.store_id.clone());

        ClusterView::booted(
            deployment_id,
            master,
            alts,
            workers,
            cfg.replication_factor,
            cfg.failover_factor,
            store_id,
        )
        .map_err(|e| {
            ControllerError::Communication(format!("new master reported an invalid view: {e}"))
        })
    }
}
