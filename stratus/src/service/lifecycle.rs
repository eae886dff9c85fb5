//! Boot configuration assembly and factor defaults.

use crate::cluster::view::BootConfiguration;
use crate::error::ControllerError;
use crate::store::StoreId;
use crate::transport::NodeRef;

/// Default failover factor for a node count: one alternate per spare
/// node, capped at two.
pub fn default_failover_factor(node_count: usize) -> u32 {
    node_count.saturating_sub(1).min(2) as u32
}

/// Default replication factor for a failover factor.
pub fn default_replication_factor(failover_factor: u32) -> u32 {
    if failover_factor == 0 {
        0
    } else {
        2
    }
}

/// Assemble a boot configuration, applying factor defaults and
/// validating the node count against the replication factor.
pub fn boot_configuration(
    nodes: Vec<NodeRef>,
    replication_factor: Option<u32>,
    failover_factor: Option<u32>,
    store_id: Option<StoreId>,
) -> Result<BootConfiguration, ControllerError> {
    let failover_factor =
        failover_factor.unwrap_or_else(|| default_failover_factor(nodes.len()));
    let replication_factor =
        replication_factor.unwrap_or_else(|| default_replication_factor(failover_factor));

    let required = (replication_factor as usize + 1).max(1);
    if nodes.len() < required {
        return Err(ControllerError::Precondition(format!(
            "{} nodes are too few for replication factor {replication_factor}; need at least {required}",
            nodes.len()
        )));
    }

    Ok(BootConfiguration {
        nodes,
        replication_factor,
        failover_factor,
        store_id,
    })
}
