//! Immutable cluster membership snapshot.
//!
//! A [`ClusterView`] is the client-local picture of a deployment: the
//! master, the ordered alternates eligible to take over, and the worker
//! set. Views are pure values: the runtime proxy replaces its view
//! wholesale after every membership-changing reply, and readers outside
//! the proxy only ever hold by-value copies.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreId;
use crate::transport::NodeRef;

/// Role a node currently plays in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Serving as the deployment master.
    Master,
    /// Replica eligible to take over as master.
    AltMaster,
    /// Executing cloud process work.
    Worker,
    /// Not part of any deployment.
    Idle,
}

/// What a node is permitted to do, independent of its current role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePermissions {
    /// May serve as master or alt-master.
    pub master: bool,
    /// May execute worker tasks.
    pub worker: bool,
}

impl NodePermissions {
    /// Full permissions: master and worker.
    pub const ALL: NodePermissions = NodePermissions {
        master: true,
        worker: true,
    };

    /// Worker-only permissions.
    pub const WORKER_ONLY: NodePermissions = NodePermissions {
        master: false,
        worker: true,
    };
}

/// A node together with its role and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node handle.
    pub node: NodeRef,
    /// Current role within the deployment.
    pub role: NodeRole,
    /// Capabilities granted to the node.
    pub permissions: NodePermissions,
    /// Whether the node runs on the controller's machine.
    pub is_local: bool,
    /// Connection URI.
    pub uri: String,
}

impl NodeInfo {
    /// Describe a node with a given role and full permissions.
    pub fn new(node: NodeRef, role: NodeRole) -> Self {
        let uri = node.uri();
        Self {
            node,
            role,
            permissions: NodePermissions::ALL,
            is_local: false,
            uri,
        }
    }

    /// Restrict the node's permissions.
    pub fn with_permissions(mut self, permissions: NodePermissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Mark the node as running locally.
    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }
}

/// Boot parameters consumed once by a master-boot operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfiguration {
    /// Nodes to include, in candidate-preference order.
    pub nodes: Vec<NodeRef>,
    /// Alt-masters to maintain in addition to the master.
    pub replication_factor: u32,
    /// Maximum alternates a client will try before giving up.
    pub failover_factor: u32,
    /// Store backing the deployment; `None` selects the configured
    /// default store.
    pub store_id: Option<StoreId>,
}

/// Violations detected when assembling a view.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("master {0} also appears in the alternates list")]
    MasterInAlts(String),

    #[error("alternates list contains duplicate node {0}")]
    DuplicateAlt(String),

    #[error("{alts} alternates exceed the failover factor {failover_factor}")]
    TooManyAlts { alts: usize, failover_factor: u32 },

    #[error("replication factor 0 does not admit alternates")]
    AltsWithoutReplication,

    #[error("a booted view requires a master node")]
    BootedWithoutMaster,
}

/// Immutable snapshot of a deployment's membership.
///
/// The zero `deployment_id` marks the unbooted state: no master is
/// defined and only membership operations are valid against the view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    /// Deployment incarnation, zero when unbooted.
    pub deployment_id: Uuid,
    /// Current master; `None` only in the unbooted state.
    pub master: Option<NodeRef>,
    /// Alternates in takeover order.
    pub alts: Vec<NodeRef>,
    /// Worker membership.
    pub workers: BTreeSet<NodeRef>,
    /// Alt-masters maintained in addition to the master.
    pub replication_factor: u32,
    /// Maximum alternates a client will try before giving up.
    pub failover_factor: u32,
    /// The store backing the deployment.
    pub store_id: StoreId,
}

impl ClusterView {
    /// The unbooted view: zero deployment id, no membership.
    pub fn unbooted(store_id: StoreId) -> Self {
        Self {
            deployment_id: Uuid::nil(),
            master: None,
            alts: Vec::new(),
            workers: BTreeSet::new(),
            replication_factor: 0,
            failover_factor: 0,
            store_id,
        }
    }

    /// Assemble a booted view, validating the membership invariants.
    pub fn booted(
        deployment_id: Uuid,
        master: NodeRef,
        alts: Vec<NodeRef>,
        workers: BTreeSet<NodeRef>,
        replication_factor: u32,
        failover_factor: u32,
        store_id: StoreId,
    ) -> Result<Self, ViewError> {
        if deployment_id.is_nil() {
            return Err(ViewError::BootedWithoutMaster);
        }
        if alts.contains(&master) {
            return Err(ViewError::MasterInAlts(master.to_string()));
        }
        for (i, alt) in alts.iter().enumerate() {
            if alts[..i].contains(alt) {
                return Err(ViewError::DuplicateAlt(alt.to_string()));
            }
        }
        if alts.len() > failover_factor as usize {
            return Err(ViewError::TooManyAlts {
                alts: alts.len(),
                failover_factor,
            });
        }
        if replication_factor == 0 && !alts.is_empty() {
            return Err(ViewError::AltsWithoutReplication);
        }
        Ok(Self {
            deployment_id,
            master: Some(master),
            alts,
            workers,
            replication_factor,
            failover_factor,
            store_id,
        })
    }

    /// Rebuild a view from a membership report, carrying over the
    /// deployment identity, factors and store of a previous view.
    ///
    /// The master and alternates are taken from the reported roles;
    /// alternates keep their report order.
    pub fn from_membership(previous: &ClusterView, nodes: &[NodeInfo]) -> Result<Self, ViewError> {
        let master = nodes
            .iter()
            .find(|n| n.role == NodeRole::Master)
            .map(|n| n.node.clone());
        let alts: Vec<NodeRef> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::AltMaster)
            .map(|n| n.node.clone())
            .collect();
        let workers: BTreeSet<NodeRef> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Worker)
            .map(|n| n.node.clone())
            .collect();

        match master {
            Some(master) => Self::booted(
                previous.deployment_id,
                master,
                alts,
                workers,
                previous.replication_factor,
                previous.failover_factor,
                previous.store_id.clone(),
            ),
            None => Err(ViewError::BootedWithoutMaster),
        }
    }

    /// Whether the view describes a live deployment.
    pub fn is_booted(&self) -> bool {
        !self.deployment_id.is_nil()
    }

    /// Whether at least one alternate is available for failover.
    pub fn has_failover(&self) -> bool {
        !self.alts.is_empty()
    }

    /// Nodes from `candidates` whose permissions admit serving as
    /// master, in the supplied order.
    pub fn candidates_for_master(candidates: &[NodeInfo]) -> Vec<NodeRef> {
        candidates
            .iter()
            .filter(|info| info.permissions.master)
            .map(|info| info.node.clone())
            .collect()
    }

    /// Dispatch targets in preference order: master first, then the
    /// alternates in takeover order. Empty when unbooted.
    pub fn ordered_targets(&self) -> Vec<NodeRef> {
        let mut targets = Vec::with_capacity(1 + self.alts.len());
        if let Some(master) = &self.master {
            targets.push(master.clone());
        }
        targets.extend(self.alts.iter().cloned());
        targets
    }

    /// All members: master, alternates and workers.
    pub fn members(&self) -> Vec<NodeRef> {
        let mut members = self.ordered_targets();
        for worker in &self.workers {
            if !members.contains(worker) {
                members.push(worker.clone());
            }
        }
        members
    }
}
