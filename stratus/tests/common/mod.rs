//! In-memory mock cluster used by the integration tests.
//!
//! Simulates the cluster side of the RPC vocabulary on top of the
//! in-process transport hub: boot, membership, master-scoped process
//! management and log accumulation, with helpers for failure injection
//! (killing the master promotes the first alternate, like the real
//! consensus layer would).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use stratus::cluster::{NodeInfo, NodeRole};
use stratus::error::RemoteErrorInfo;
use stratus::process::{ProcessId, ProcessRecord, ProcessStatus};
use stratus::store::StoreId;
use stratus::transport::{
    ClusterDeploymentInfo, ClusterReply, ClusterRequest, InMemoryHub, LogEntry, LogLevel,
    NodeDeploymentInfo, NodeRef, RequestEnvelope, TransportError,
};
use uuid::Uuid;

/// Number of status polls after which a "quick-" process completes.
const QUICK_PROCESS_POLLS: u32 = 3;

struct ClusterState {
    deployment_id: Uuid,
    active: bool,
    roles: BTreeMap<NodeRef, NodeRole>,
    replication_factor: u32,
    failover_factor: u32,
    store_id: StoreId,
    processes: BTreeMap<ProcessId, ProcessRecord>,
    payloads: BTreeMap<ProcessId, Vec<u8>>,
    polls: BTreeMap<ProcessId, u32>,
    logs: Vec<LogEntry>,
}

impl ClusterState {
    fn membership(&self) -> Vec<NodeInfo> {
        self.roles
            .iter()
            .filter(|(_, role)| **role != NodeRole::Idle)
            .map(|(node, role)| NodeInfo::new(node.clone(), *role))
            .collect()
    }

    fn log(&mut self, node: &NodeRef, message: &str, process: Option<ProcessId>) {
        self.logs.push(LogEntry {
            time: Utc::now(),
            node: node.clone(),
            level: LogLevel::Info,
            message: message.to_string(),
            process_id: process,
        });
    }
}

/// A scripted multi-node cluster behind an [`InMemoryHub`].
pub struct MockCluster {
    pub hub: Arc<InMemoryHub>,
    state: Arc<Mutex<ClusterState>>,
    nodes: Vec<NodeRef>,
    requests: Arc<AtomicUsize>,
}

impl MockCluster {
    /// Create a cluster of idle nodes.
    pub fn new(specs: &[(&str, u16)]) -> Self {
        let hub = Arc::new(InMemoryHub::new());
        let state = Arc::new(Mutex::new(ClusterState {
            deployment_id: Uuid::nil(),
            active: false,
            roles: BTreeMap::new(),
            replication_factor: 0,
            failover_factor: 0,
            store_id: StoreId::local_fs("/tmp/mock-store"),
            processes: BTreeMap::new(),
            payloads: BTreeMap::new(),
            polls: BTreeMap::new(),
            logs: Vec::new(),
        }));
        let requests = Arc::new(AtomicUsize::new(0));

        let mut cluster = Self {
            hub,
            state,
            nodes: Vec::new(),
            requests,
        };
        for (id, port) in specs {
            cluster.add_node(id, *port);
        }
        cluster
    }

    /// Register one more idle node.
    pub fn add_node(&mut self, id: &str, port: u16) -> NodeRef {
        let node = NodeRef::new(id, format!("127.0.0.1:{port}").parse().unwrap());
        self.state
            .lock()
            .unwrap()
            .roles
            .insert(node.clone(), NodeRole::Idle);
        self.hub
            .register(node.clone(), node_handler(self.state.clone(), self.requests.clone()));
        self.nodes.push(node.clone());
        node
    }

    /// All registered node refs, in registration order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.nodes.clone()
    }

    /// Node ref by id.
    pub fn node(&self, id: &str) -> NodeRef {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .expect("unknown mock node")
            .clone()
    }

    /// Total requests any node has received.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// The current master according to cluster state.
    pub fn master(&self) -> Option<NodeRef> {
        self.state
            .lock()
            .unwrap()
            .roles
            .iter()
            .find(|(_, role)| **role == NodeRole::Master)
            .map(|(node, _)| node.clone())
    }

    /// Kill the master: it goes unreachable and the first alternate is
    /// promoted, the way the cluster-side consensus would elect it.
    ///
    /// Returns `(dead_master, promoted)`.
    pub fn kill_master(&self) -> (NodeRef, NodeRef) {
        let mut state = self.state.lock().unwrap();
        let master = state
            .roles
            .iter()
            .find(|(_, role)| **role == NodeRole::Master)
            .map(|(node, _)| node.clone())
            .expect("no master to kill");
        let promoted = state
            .roles
            .iter()
            .find(|(_, role)| **role == NodeRole::AltMaster)
            .map(|(node, _)| node.clone())
            .expect("no alternate to promote");

        state.roles.insert(master.clone(), NodeRole::Idle);
        state.roles.insert(promoted.clone(), NodeRole::Master);
        drop(state);

        self.hub.disconnect(&master);
        (master, promoted)
    }

    /// Make every node unreachable.
    pub fn partition_all(&self) {
        for node in &self.nodes {
            self.hub.disconnect(node);
        }
    }
}

fn node_handler(
    state: Arc<Mutex<ClusterState>>,
    requests: Arc<AtomicUsize>,
) -> stratus::transport::NodeHandler {
    Arc::new(move |receiver, envelope| {
        let state = state.clone();
        let requests = requests.clone();
        Box::pin(async move {
            requests.fetch_add(1, Ordering::SeqCst);
            handle(&state, &receiver, envelope)
        })
    })
}

fn remote_error(message: impl Into<String>) -> ClusterReply {
    ClusterReply::Error(RemoteErrorInfo::new(message))
}

fn handle(
    state: &Mutex<ClusterState>,
    receiver: &NodeRef,
    envelope: RequestEnvelope,
) -> Result<ClusterReply, TransportError> {
    let mut state = state.lock().unwrap();
    let role = state
        .roles
        .get(receiver)
        .copied()
        .unwrap_or(NodeRole::Idle);

    let reply = match envelope.request {
        // Node-scoped requests are answered in any role.
        ClusterRequest::GetNodeDeploymentInfo { with_perf } => {
            ClusterReply::NodeInfo(NodeDeploymentInfo {
                node: NodeInfo::new(receiver.clone(), role),
                deployment_id: if state.active {
                    state.deployment_id
                } else {
                    Uuid::nil()
                },
                uptime_secs: 42,
                perf: with_perf.then(Default::default),
            })
        }
        ClusterRequest::GetAllNodes => ClusterReply::Nodes(state.membership()),
        ClusterRequest::Detach => {
            state.roles.insert(receiver.clone(), NodeRole::Idle);
            ClusterReply::Ack
        }
        ClusterRequest::MasterBoot(cfg) => {
            if state.active {
                return Ok(remote_error("cluster is already active"));
            }
            if !cfg.nodes.contains(receiver) {
                return Ok(remote_error("boot candidate is not in the configuration"));
            }

            let alt_count = cfg.replication_factor.min(cfg.failover_factor) as usize;
            let others: Vec<NodeRef> = cfg
                .nodes
                .iter()
                .filter(|n| *n != receiver)
                .cloned()
                .collect();
            let alts: Vec<NodeRef> = others.iter().take(alt_count).cloned().collect();

            state.deployment_id = Uuid::new_v4();
            state.active = true;
            state.replication_factor = cfg.replication_factor;
            state.failover_factor = cfg.failover_factor;
            state.roles.insert(receiver.clone(), NodeRole::Master);
            for node in &others {
                let role = if alts.contains(node) {
                    NodeRole::AltMaster
                } else {
                    NodeRole::Worker
                };
                state.roles.insert(node.clone(), role);
            }

            ClusterReply::Booted {
                deployment_id: state.deployment_id,
                master: receiver.clone(),
                alts,
            }
        }

        // Everything else is master-scoped: alternates hold replicated
        // state and answer too, workers do not.
        request => {
            if !matches!(role, NodeRole::Master | NodeRole::AltMaster) {
                return Ok(remote_error("node is not a master"));
            }
            if !state.active {
                return Ok(remote_error("cluster is not active"));
            }
            match request {
                ClusterRequest::Ping { silent } => {
                    if !silent {
                        let receiver = receiver.clone();
                        state.log(&receiver, "ping", None);
                    }
                    ClusterReply::Pong
                }
                ClusterRequest::GetClusterDeploymentInfo { with_perf } => {
                    ClusterReply::ClusterInfo(ClusterDeploymentInfo {
                        deployment_id: state.deployment_id,
                        active: state.active,
                        nodes: state.membership(),
                        replication_factor: state.replication_factor,
                        failover_factor: state.failover_factor,
                        store_id: state.store_id.clone(),
                        perf: with_perf.then(Default::default),
                    })
                }
                ClusterRequest::ShutdownSync => {
                    state.active = false;
                    state.deployment_id = Uuid::nil();
                    let nodes: Vec<NodeRef> = state.roles.keys().cloned().collect();
                    for node in nodes {
                        state.roles.insert(node, NodeRole::Idle);
                    }
                    ClusterReply::Ack
                }
                ClusterRequest::Shutdown => ClusterReply::Ack,
                ClusterRequest::Attach(node) => {
                    state.roles.insert(node, NodeRole::Worker);
                    ClusterReply::Ack
                }
                ClusterRequest::CreateProcess(image) => {
                    for dep in &image.dependencies {
                        if dep.assembly_id.starts_with("missing") {
                            return Ok(remote_error(format!(
                                "missing dependency: {}",
                                dep.assembly_id
                            )));
                        }
                    }
                    let id = ProcessId::from_uuid(Uuid::new_v4());
                    let record = ProcessRecord {
                        id,
                        name: image.name.clone(),
                        return_type_tag: image.return_type_tag.clone(),
                        status: ProcessStatus::Running,
                        result: None,
                        error: None,
                        created_at: Utc::now(),
                        completed_at: None,
                    };
                    state.processes.insert(id, record);
                    state.payloads.insert(id, image.payload.clone());
                    state.polls.insert(id, 0);
                    let receiver = receiver.clone();
                    state.log(&receiver, "process created", Some(id));
                    ClusterReply::ProcessCreated(id)
                }
                ClusterRequest::GetProcess(id) => {
                    let polls = {
                        let entry = state.polls.entry(id).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let payload = state.payloads.get(&id).cloned();
                    match state.processes.get_mut(&id) {
                        Some(record) => {
                            // "quick-" processes finish after a few polls,
                            // echoing their payload as the result.
                            if record.status == ProcessStatus::Running
                                && record.name.starts_with("quick-")
                                && polls >= QUICK_PROCESS_POLLS
                            {
                                record.status = ProcessStatus::Completed;
                                record.result = payload;
                                record.completed_at = Some(Utc::now());
                            }
                            ClusterReply::Process(record.clone())
                        }
                        None => ClusterReply::ProcessNotFound(id),
                    }
                }
                ClusterRequest::GetAllProcesses => {
                    ClusterReply::Processes(state.processes.values().cloned().collect())
                }
                ClusterRequest::KillProcess(id) => match state.processes.get_mut(&id) {
                    Some(record) => {
                        record.status = ProcessStatus::Killed;
                        record.completed_at = Some(Utc::now());
                        ClusterReply::Ack
                    }
                    None => ClusterReply::ProcessNotFound(id),
                },
                ClusterRequest::ClearProcessInfo(Some(id)) => {
                    state.processes.remove(&id);
                    state.payloads.remove(&id);
                    state.polls.remove(&id);
                    ClusterReply::Ack
                }
                ClusterRequest::ClearProcessInfo(None) => {
                    let terminal: Vec<ProcessId> = state
                        .processes
                        .iter()
                        .filter(|(_, r)| r.status.is_terminal())
                        .map(|(id, _)| *id)
                        .collect();
                    for id in terminal {
                        state.processes.remove(&id);
                        state.payloads.remove(&id);
                        state.polls.remove(&id);
                    }
                    ClusterReply::Ack
                }
                ClusterRequest::GetLogDump(process) => {
                    let entries = state
                        .logs
                        .iter()
                        .filter(|e| process.is_none() || e.process_id == process)
                        .cloned()
                        .collect();
                    ClusterReply::LogDump(entries)
                }
                ClusterRequest::GetNodeDeploymentInfo { .. }
                | ClusterRequest::GetAllNodes
                | ClusterRequest::Detach
                | ClusterRequest::MasterBoot(_) => unreachable!("handled above"),
            }
        }
    };

    Ok(reply)
}
