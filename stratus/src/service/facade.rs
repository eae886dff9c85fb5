//! High-level cluster controller facade.
//!
//! [`StratusCluster`] wires the transport, the runtime proxy daemon,
//! the metadata cache and the process manager into one handle. Every
//! lifecycle operation checks its preconditions against the local view
//! before any side effect, then prepares a message, submits it through
//! the proxy and interprets the reply.
//!
//! # Example
//!
//! ```ignore
//! use stratus::service::StratusCluster;
//! use stratus::transport::TcpTransport;
//!
//! let transport = Arc::new(TcpTransport::new());
//! let cluster = StratusCluster::connect(transport, &seed_nodes).await?;
//! let rtt = cluster.ping().await?;
//! cluster.shutdown().await?;
//! cluster.dispose().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::dispatch::FailoverDispatcher;
use crate::cluster::metadata::{Cached, CachedMetadata};
use crate::cluster::view::ClusterView;
use crate::config::settings::{Settings, SettingsHandle};
use crate::error::ControllerError;
use crate::local::{LocalNode, LocalSpawner};
use crate::package::{ComputationImage, ComputationPackager, StagedDependency};
use crate::process::{ProcessHandle, ProcessId, ProcessManager, ProcessRecord};
use crate::runtime::proxy::{ProxyClient, ProxyDaemon};
use crate::service::lifecycle;
use crate::store::{StoreId, StoreRegistry};
use crate::transport::message::{
    ClusterDeploymentInfo, ClusterReply, ClusterRequest, LogEntry, NodeDeploymentInfo,
    RequestEnvelope,
};
use crate::transport::{NodeRef, Transport};

/// How long `attach_local` waits for a spawned node to answer.
const LOCAL_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Poll interval while waiting for a spawned node.
const LOCAL_STARTUP_POLL: Duration = Duration::from_millis(300);

/// Client-side controller for one stratus cluster.
pub struct StratusCluster {
    transport: Arc<dyn Transport>,
    client: ProxyClient,
    shutdown: CancellationToken,
    daemon_handle: Mutex<Option<JoinHandle<()>>>,
    metadata: CachedMetadata,
    processes: ProcessManager,
    packager: ComputationPackager,
    settings: Arc<Settings>,
    local_nodes: tokio::sync::Mutex<Vec<LocalNode>>,
    last_members: Mutex<Option<Vec<NodeRef>>>,
    disposed: AtomicBool,
}

impl StratusCluster {
    /// Wire the controller around an initial view.
    fn with_view(
        transport: Arc<dyn Transport>,
        settings: Arc<Settings>,
        view: ClusterView,
    ) -> Result<Self, ControllerError> {
        settings.prepare_working_directory()?;
        StoreRegistry::global().activate(settings.default_store.clone());

        let members = view.is_booted().then(|| view.members());

        let dispatcher = FailoverDispatcher::new(
            transport.clone(),
            settings.client_id,
            settings.default_timeout,
        );
        let (daemon, client) = ProxyDaemon::new(view, dispatcher);
        let shutdown = CancellationToken::new();
        let daemon_handle = tokio::spawn(daemon.run(shutdown.clone()));

        Ok(Self {
            transport,
            client: client.clone(),
            shutdown,
            daemon_handle: Mutex::new(Some(daemon_handle)),
            metadata: CachedMetadata::new(client.clone()),
            processes: ProcessManager::new(client),
            packager: ComputationPackager::new(settings.client_id),
            settings,
            local_nodes: tokio::sync::Mutex::new(Vec::new()),
            last_members: Mutex::new(members),
            disposed: AtomicBool::new(false),
        })
    }

    /// Create a controller for a cluster that has not been booted yet.
    pub fn new_unbooted(transport: Arc<dyn Transport>) -> Result<Self, ControllerError> {
        let settings = SettingsHandle::global().current();
        let view = ClusterView::unbooted(settings.default_store.id());
        Self::with_view(transport, settings, view)
    }

    /// Join an already-booted cluster by probing the seed nodes for
    /// deployment info.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        seeds: &[NodeRef],
    ) -> Result<Self, ControllerError> {
        let settings = SettingsHandle::global().current();

        let mut last_err = ControllerError::ClusterUnreachable;
        for seed in seeds {
            let envelope = RequestEnvelope::new(
                settings.client_id,
                ClusterRequest::GetClusterDeploymentInfo { with_perf: false },
            );
            match transport
                .request(seed, envelope, settings.default_timeout)
                .await
            {
                Ok(ClusterReply::ClusterInfo(info)) => {
                    let view = Self::view_from_info(&info)?;
                    info!(
                        deployment = %view.deployment_id,
                        master = ?view.master,
                        "connected to cluster"
                    );
                    return Self::with_view(transport, settings, view);
                }
                Ok(other) => {
                    last_err = ControllerError::Communication(format!(
                        "unexpected reply from seed {seed}: {other:?}"
                    ));
                }
                Err(err) => {
                    warn!(seed = %seed, error = %err, "seed probe failed");
                    last_err = err.into();
                }
            }
        }
        Err(last_err)
    }

    /// Spawn `count` local nodes and boot a cluster on them.
    pub async fn init_local(
        transport: Arc<dyn Transport>,
        count: usize,
        base_port: u16,
    ) -> Result<Self, ControllerError> {
        let controller = Self::new_unbooted(transport)?;
        let spawner = LocalSpawner::from_settings(&controller.settings)?;
        let nodes = spawner.spawn_many(count, base_port, false)?;
        let refs: Vec<NodeRef> = nodes.iter().map(|n| n.node_ref().clone()).collect();
        controller.local_nodes.lock().await.extend(nodes);

        controller.await_node_startup(&refs).await?;
        controller.boot(refs, None, None, None).await?;
        Ok(controller)
    }

    fn view_from_info(info: &ClusterDeploymentInfo) -> Result<ClusterView, ControllerError> {
        let template = ClusterView {
            deployment_id: info.deployment_id,
            master: None,
            alts: Vec::new(),
            workers: Default::default(),
            replication_factor: info.replication_factor,
            failover_factor: info.failover_factor,
            store_id: info.store_id.clone(),
        };
        ClusterView::from_membership(&template, &info.nodes).map_err(|e| {
            ControllerError::Communication(format!("seed reported an invalid view: {e}"))
        })
    }

    fn ensure_live(&self) -> Result<(), ControllerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ControllerError::Disposed);
        }
        Ok(())
    }

    // =========================================================================
    // Cluster state
    // =========================================================================

    /// The proxy's current view. Local query; never touches the
    /// network.
    pub async fn last_view(&self) -> Result<ClusterView, ControllerError> {
        self.ensure_live()?;
        self.client.last_view().await
    }

    /// Whether the controller currently sees a booted deployment.
    pub async fn is_active(&self) -> Result<bool, ControllerError> {
        Ok(self.last_view().await?.is_booted())
    }

    /// Round-trip a ping through the current master.
    pub async fn ping(&self) -> Result<Duration, ControllerError> {
        self.ensure_live()?;
        let started = Instant::now();
        match self
            .client
            .request(ClusterRequest::Ping { silent: false })
            .await?
        {
            ClusterReply::Pong => Ok(started.elapsed()),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to Ping: {other:?}"
            ))),
        }
    }

    /// Deployment-wide info through the metadata cache.
    pub async fn cluster_info(
        &self,
    ) -> Result<Cached<ClusterDeploymentInfo>, ControllerError> {
        self.ensure_live()?;
        self.metadata.cluster_deployment_info().await
    }

    /// Node info through the metadata cache.
    pub async fn node_info(&self) -> Result<Cached<NodeDeploymentInfo>, ControllerError> {
        self.ensure_live()?;
        self.metadata.node_deployment_info().await
    }

    /// Log entries accumulated by the cluster, optionally scoped to one
    /// process.
    pub async fn logs(
        &self,
        process: Option<ProcessId>,
    ) -> Result<Vec<LogEntry>, ControllerError> {
        self.ensure_live()?;
        match self
            .client
            .request(ClusterRequest::GetLogDump(process))
            .await?
        {
            ClusterReply::LogDump(entries) => Ok(entries),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetLogDump: {other:?}"
            ))),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Boot a deployment on the given nodes.
    ///
    /// Fails `Precondition` without network traffic when the controller
    /// already sees a booted deployment.
    pub async fn boot(
        &self,
        nodes: Vec<NodeRef>,
        replication_factor: Option<u32>,
        failover_factor: Option<u32>,
        store_id: Option<StoreId>,
    ) -> Result<Uuid, ControllerError> {
        self.ensure_live()?;
        if self.last_view().await?.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is already active".into(),
            ));
        }

        let cfg = lifecycle::boot_configuration(
            nodes,
            replication_factor,
            failover_factor,
            store_id,
        )?;
        let members = cfg.nodes.clone();

        match self
            .client
            .request(ClusterRequest::MasterBoot(cfg))
            .await?
        {
            ClusterReply::Booted { deployment_id, .. } => {
                *self.last_members.lock().expect("members lock poisoned") = Some(members);
                Ok(deployment_id)
            }
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to MasterBoot: {other:?}"
            ))),
        }
    }

    /// Boot again on the last known node list.
    ///
    /// Fails `Precondition` when no prior view recorded a membership,
    /// even if a configuration could otherwise be reconstructed.
    pub async fn boot_in_place(
        &self,
        replication_factor: Option<u32>,
        failover_factor: Option<u32>,
    ) -> Result<Uuid, ControllerError> {
        self.ensure_live()?;
        if self.last_view().await?.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is already active".into(),
            ));
        }

        let members = self
            .last_members
            .lock()
            .expect("members lock poisoned")
            .clone()
            .ok_or_else(|| {
                ControllerError::Precondition("insufficient cluster information".into())
            })?;
        self.boot(members, replication_factor, failover_factor, None)
            .await
    }

    /// Shut the deployment down and wait for the acknowledgement.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.ensure_live()?;
        if !self.last_view().await?.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is not active".into(),
            ));
        }

        match self.client.request(ClusterRequest::ShutdownSync).await? {
            ClusterReply::Ack => {
                info!("cluster shut down");
                Ok(())
            }
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to ShutdownSync: {other:?}"
            ))),
        }
    }

    /// Shutdown followed by a boot on the last known node list.
    pub async fn reboot(
        &self,
        replication_factor: Option<u32>,
        failover_factor: Option<u32>,
    ) -> Result<Uuid, ControllerError> {
        self.shutdown().await?;
        self.boot_in_place(replication_factor, failover_factor).await
    }

    /// Attach a node to the deployment as a worker.
    pub async fn attach(&self, node: NodeRef) -> Result<(), ControllerError> {
        self.ensure_live()?;
        if !self.last_view().await?.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is not active".into(),
            ));
        }

        match self
            .client
            .request(ClusterRequest::Attach(node.clone()))
            .await?
        {
            ClusterReply::Ack => {
                info!(node = %node, "node attached");
                Ok(())
            }
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to Attach: {other:?}"
            ))),
        }
    }

    /// Detach a worker from the deployment.
    ///
    /// The detach message goes to the node itself, not through the
    /// master; the view is reconciled with a membership read afterward.
    pub async fn detach(&self, node: NodeRef) -> Result<(), ControllerError> {
        self.ensure_live()?;
        let view = self.last_view().await?;
        if !view.workers.contains(&node) {
            return Err(ControllerError::Precondition(format!(
                "node {node} is not a worker of this deployment"
            )));
        }

        let envelope =
            RequestEnvelope::new(self.settings.client_id, ClusterRequest::Detach);
        match self
            .transport
            .request(&node, envelope, self.settings.default_timeout)
            .await
            .map_err(ControllerError::from)?
        {
            ClusterReply::Ack => {}
            other => {
                return Err(ControllerError::Communication(format!(
                    "unexpected reply to Detach: {other:?}"
                )))
            }
        }
        info!(node = %node, "node detached");

        // Reconcile the view. The detach itself already succeeded, so a
        // failed refresh only delays the local picture.
        if let Err(err) = self.client.request(ClusterRequest::GetAllNodes).await {
            warn!(error = %err, "membership refresh after detach failed");
        }
        Ok(())
    }

    /// Spawn `count` worker processes on this machine and attach them.
    pub async fn attach_local(
        &self,
        count: usize,
        base_port: u16,
    ) -> Result<Vec<NodeRef>, ControllerError> {
        self.ensure_live()?;
        if !self.last_view().await?.is_booted() {
            return Err(ControllerError::Precondition(
                "cluster is not active".into(),
            ));
        }

        let spawner = LocalSpawner::from_settings(&self.settings)?;
        let nodes = spawner.spawn_many(count, base_port, false)?;
        let refs: Vec<NodeRef> = nodes.iter().map(|n| n.node_ref().clone()).collect();
        self.local_nodes.lock().await.extend(nodes);

        self.await_node_startup(&refs).await?;
        for node in &refs {
            self.attach(node.clone()).await?;
        }
        Ok(refs)
    }

    /// Forcibly terminate every local node process and dispose.
    ///
    /// Only valid when every member of the deployment is a node this
    /// controller spawned.
    pub async fn kill(&self) -> Result<(), ControllerError> {
        self.ensure_live()?;
        let view = self.last_view().await?;
        {
            let local = self.local_nodes.lock().await;
            let owned: Vec<&NodeRef> = local.iter().map(|n| n.node_ref()).collect();
            for member in view.members() {
                if !owned.iter().any(|n| **n == member) {
                    return Err(ControllerError::Precondition(format!(
                        "node {member} was not spawned by this controller; kill requires a fully local cluster"
                    )));
                }
            }
        }
        self.kill_local_nodes().await;
        self.dispose().await;
        Ok(())
    }

    /// Wait until every spawned node answers a deployment-info probe.
    async fn await_node_startup(&self, nodes: &[NodeRef]) -> Result<(), ControllerError> {
        let deadline = Instant::now() + LOCAL_STARTUP_TIMEOUT;
        for node in nodes {
            loop {
                let envelope = RequestEnvelope::new(
                    self.settings.client_id,
                    ClusterRequest::GetNodeDeploymentInfo { with_perf: false },
                );
                match self
                    .transport
                    .request(node, envelope, LOCAL_STARTUP_POLL)
                    .await
                {
                    Ok(_) => break,
                    Err(_) if Instant::now() < deadline => {
                        tokio::time::sleep(LOCAL_STARTUP_POLL).await;
                    }
                    Err(err) => {
                        return Err(ControllerError::Configuration(format!(
                            "local node {node} did not come up: {err}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    async fn kill_local_nodes(&self) {
        let mut local = self.local_nodes.lock().await;
        for node in local.iter_mut() {
            if let Err(err) = node.kill().await {
                warn!(node = %node.node_ref(), error = %err, "failed to kill local node");
            }
        }
        local.clear();
    }

    // =========================================================================
    // Cloud processes
    // =========================================================================

    /// Package a computation and submit it in one step.
    pub async fn submit<T: Serialize>(
        &self,
        computation: &T,
        return_type_tag: &str,
        dependencies: Vec<StagedDependency>,
    ) -> Result<ProcessHandle, ControllerError> {
        self.ensure_live()?;
        let outcome = self
            .packager
            .package(computation, return_type_tag, dependencies)?;
        for warning in &outcome.warnings {
            warn!(image = %outcome.image.name, "{warning}");
        }
        self.processes.create(outcome.image).await
    }

    /// Submit an already-packaged image.
    pub async fn create_process(
        &self,
        image: ComputationImage,
    ) -> Result<ProcessHandle, ControllerError> {
        self.ensure_live()?;
        self.processes.create(image).await
    }

    /// Resolve a handle from a process id.
    pub async fn process(&self, id: ProcessId) -> Result<ProcessHandle, ControllerError> {
        self.ensure_live()?;
        self.processes.get(id).await
    }

    /// All process records known to the deployment.
    pub async fn processes(&self) -> Result<Vec<ProcessRecord>, ControllerError> {
        self.ensure_live()?;
        self.processes.get_all().await
    }

    /// Kill a process by id.
    pub async fn kill_process(&self, id: ProcessId) -> Result<(), ControllerError> {
        self.ensure_live()?;
        self.processes.kill(id).await
    }

    /// Remove the persisted record of a terminal process.
    pub async fn clear_process_info(&self, id: ProcessId) -> Result<(), ControllerError> {
        self.ensure_live()?;
        self.processes.clear_info(id).await
    }

    /// Remove the persisted records of all terminal processes.
    pub async fn clear_all_process_info(&self) -> Result<(), ControllerError> {
        self.ensure_live()?;
        self.processes.clear_all_info().await
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Tear the controller down: stop the proxy daemon and kill any
    /// local nodes it spawned.
    ///
    /// Idempotent; transport errors during teardown are swallowed.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing cluster controller");

        self.client.terminate().await;
        self.shutdown.cancel();
        self.kill_local_nodes().await;

        let handle = self
            .daemon_handle
            .lock()
            .expect("daemon handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "proxy daemon task ended abnormally");
            }
        }
    }
}

impl Drop for StratusCluster {
    fn drop(&mut self) {
        // Best-effort teardown when dropped without a dispose call: the
        // daemon exits on cancellation and children die via
        // kill_on_drop.
        if !self.disposed.load(Ordering::SeqCst) {
            self.shutdown.cancel();
        }
    }
}
