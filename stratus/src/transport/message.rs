//! Cluster-facing RPC vocabulary.
//!
//! Every message the controller can put on the wire is a variant of
//! [`ClusterRequest`]; every reply a node can return is a variant of
//! [`ClusterReply`]. The cluster side is out of scope for this crate but
//! must speak this vocabulary.
//!
//! Requests travel inside a [`RequestEnvelope`] carrying the client id
//! and a fresh request id. The cluster-side handler uses the
//! `(client_id, request_id)` tuple to deduplicate retried deliveries, so
//! the dispatcher is free to re-send on communication failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::view::{BootConfiguration, NodeInfo};
use crate::error::RemoteErrorInfo;
use crate::package::ComputationImage;
use crate::process::{ProcessId, ProcessRecord};
use crate::store::StoreId;
use crate::transport::NodeRef;

/// Envelope around a request, carrying identity for cluster-side dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Identifier of the submitting controller.
    pub client_id: Uuid,
    /// Fresh per-request identifier. Retries reuse the same id so the
    /// cluster can recognize duplicate deliveries.
    pub request_id: Uuid,
    /// The request proper.
    pub request: ClusterRequest,
}

impl RequestEnvelope {
    /// Wrap a request with a fresh request id.
    pub fn new(client_id: Uuid, request: ClusterRequest) -> Self {
        Self {
            client_id,
            request_id: Uuid::new_v4(),
            request,
        }
    }
}

/// Requests the controller sends to cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterRequest {
    /// Liveness check against the master. `silent` suppresses the
    /// cluster-side log entry.
    Ping { silent: bool },

    /// Ask any node for the current cluster membership.
    GetAllNodes,

    /// Ask the master for deployment-wide information, optionally with
    /// performance counters.
    GetClusterDeploymentInfo { with_perf: bool },

    /// Ask a node for its own deployment information, optionally with
    /// performance counters.
    GetNodeDeploymentInfo { with_perf: bool },

    /// Boot a cluster with this node as the master candidate.
    MasterBoot(BootConfiguration),

    /// Shut the deployment down; the master acknowledges once every
    /// node has stopped.
    ShutdownSync,

    /// Fire-and-forget shutdown. Kept for wire compatibility with older
    /// daemons; the controller always uses [`ClusterRequest::ShutdownSync`].
    Shutdown,

    /// Attach a node to the deployment as a worker.
    Attach(NodeRef),

    /// Detach the receiving node from its deployment. Sent to the node
    /// itself, not to the master.
    Detach,

    /// Submit a cloud process for execution.
    CreateProcess(ComputationImage),

    /// Kill a running cloud process.
    KillProcess(ProcessId),

    /// Fetch a single process record.
    GetProcess(ProcessId),

    /// Fetch all process records known to the deployment.
    GetAllProcesses,

    /// Remove the persisted record of one process, or of all terminal
    /// processes when no id is given.
    ClearProcessInfo(Option<ProcessId>),

    /// Fetch accumulated log entries, optionally scoped to a process.
    GetLogDump(Option<ProcessId>),
}

impl ClusterRequest {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterRequest::Ping { .. } => "Ping",
            ClusterRequest::GetAllNodes => "GetAllNodes",
            ClusterRequest::GetClusterDeploymentInfo { .. } => "GetClusterDeploymentInfo",
            ClusterRequest::GetNodeDeploymentInfo { .. } => "GetNodeDeploymentInfo",
            ClusterRequest::MasterBoot(_) => "MasterBoot",
            ClusterRequest::ShutdownSync => "ShutdownSync",
            ClusterRequest::Shutdown => "Shutdown",
            ClusterRequest::Attach(_) => "Attach",
            ClusterRequest::Detach => "Detach",
            ClusterRequest::CreateProcess(_) => "CreateProcess",
            ClusterRequest::KillProcess(_) => "KillProcess",
            ClusterRequest::GetProcess(_) => "GetProcess",
            ClusterRequest::GetAllProcesses => "GetAllProcesses",
            ClusterRequest::ClearProcessInfo(_) => "ClearProcessInfo",
            ClusterRequest::GetLogDump(_) => "GetLogDump",
        }
    }
}

/// Replies cluster nodes return to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterReply {
    /// Reply to [`ClusterRequest::Ping`].
    Pong,

    /// Current membership with roles and permissions.
    Nodes(Vec<NodeInfo>),

    /// Deployment-wide information.
    ClusterInfo(ClusterDeploymentInfo),

    /// Per-node information.
    NodeInfo(NodeDeploymentInfo),

    /// Successful boot: the new deployment and its master line-up.
    Booted {
        deployment_id: Uuid,
        master: NodeRef,
        alts: Vec<NodeRef>,
    },

    /// Generic acknowledgement.
    Ack,

    /// Process accepted; the cluster-assigned id.
    ProcessCreated(ProcessId),

    /// A single process record.
    Process(ProcessRecord),

    /// No record exists for the requested process id.
    ProcessNotFound(ProcessId),

    /// All known process records.
    Processes(Vec<ProcessRecord>),

    /// Accumulated log entries.
    LogDump(Vec<LogEntry>),

    /// The node handled the request but rejected it. Never produced by
    /// `Transport::request`: transports convert this variant into
    /// `TransportError::Remote` before returning.
    Error(RemoteErrorInfo),
}

/// Severity of a cluster-side log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One log entry accumulated by the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded on the emitting node.
    pub time: DateTime<Utc>,
    /// The node that emitted the entry.
    pub node: NodeRef,
    /// Entry severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// The cloud process the entry belongs to, if any.
    pub process_id: Option<ProcessId>,
}

/// Point-in-time performance counters collected by a worker node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerformanceCounters {
    /// CPU usage, 0.0 to 100.0.
    pub cpu_usage: f64,
    /// Total physical memory in megabytes.
    pub total_memory_mb: f64,
    /// Memory in use in megabytes.
    pub memory_usage_mb: f64,
    /// Upstream network traffic in kilobytes per second.
    pub network_up_kbps: f64,
    /// Downstream network traffic in kilobytes per second.
    pub network_down_kbps: f64,
}

/// Deployment-wide information returned by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDeploymentInfo {
    /// The deployment this report describes. Zero when unbooted.
    pub deployment_id: Uuid,
    /// Whether the deployment is currently active.
    pub active: bool,
    /// Full membership with roles.
    pub nodes: Vec<NodeInfo>,
    /// Number of alt-masters maintained in addition to the master.
    pub replication_factor: u32,
    /// Maximum alternates a client will try before giving up.
    pub failover_factor: u32,
    /// The store backing the deployment.
    pub store_id: StoreId,
    /// Aggregated counters, present when requested with `with_perf`.
    pub perf: Option<PerformanceCounters>,
}

/// Per-node information returned by any node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeploymentInfo {
    /// The reporting node with its role and permissions.
    pub node: NodeInfo,
    /// The deployment the node belongs to. Zero when idle.
    pub deployment_id: Uuid,
    /// Seconds since the node process started.
    pub uptime_secs: u64,
    /// Node counters, present when requested with `with_perf`.
    pub perf: Option<PerformanceCounters>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(id: &str, port: u16) -> NodeRef {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        NodeRef::new(id, addr)
    }

    #[test]
    fn test_envelope_assigns_fresh_request_id() {
        let client = Uuid::new_v4();
        let a = RequestEnvelope::new(client, ClusterRequest::GetAllNodes);
        let b = RequestEnvelope::new(client, ClusterRequest::GetAllNodes);
        assert_eq!(a.client_id, b.client_id);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_request_names() {
        assert_eq!(ClusterRequest::Ping { silent: false }.name(), "Ping");
        assert_eq!(ClusterRequest::GetAllNodes.name(), "GetAllNodes");
        assert_eq!(ClusterRequest::ShutdownSync.name(), "ShutdownSync");
        assert_eq!(
            ClusterRequest::Attach(node("n4", 7004)).name(),
            "Attach"
        );
    }

    #[test]
    fn test_request_round_trips_through_bincode() {
        let env = RequestEnvelope::new(
            Uuid::new_v4(),
            ClusterRequest::Attach(node("n4", 7004)),
        );
        let bytes = bincode::serialize(&env).unwrap();
        let decoded: RequestEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.request_id, env.request_id);
        match decoded.request {
            ClusterRequest::Attach(n) => assert_eq!(n.id(), "n4"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_reply_round_trips_through_bincode() {
        let reply = ClusterReply::Booted {
            deployment_id: Uuid::new_v4(),
            master: node("n1", 7001),
            alts: vec![node("n2", 7002)],
        };
        let bytes = bincode::serialize(&reply).unwrap();
        let decoded: ClusterReply = bincode::deserialize(&bytes).unwrap();
        match decoded {
            ClusterReply::Booted { master, alts, .. } => {
                assert_eq!(master.id(), "n1");
                assert_eq!(alts.len(), 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
