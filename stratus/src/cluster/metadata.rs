//! TTL-cached cluster and node metadata.
//!
//! The only place the controller tolerates stale data. Deployment info
//! reads are memoized for a short TTL and refreshed through the runtime
//! proxy; when a refresh fails the last successful value is returned
//! with `is_stale` set, so dashboards keep rendering through transient
//! outages. Mutating operations never go through this layer.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::ControllerError;
use crate::runtime::proxy::ProxyClient;
use crate::transport::message::{
    ClusterDeploymentInfo, ClusterReply, ClusterRequest, NodeDeploymentInfo,
};

/// Default freshness window for metadata entries.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_millis(2000);

/// A cached value with its staleness marker.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    /// The cached value.
    pub value: T,
    /// True when the value outlived its TTL because a refresh failed.
    pub is_stale: bool,
}

/// One TTL-memoized entry.
///
/// The value slot is guarded by a cheap sync mutex; refreshes serialize
/// on a separate async mutex so fresh readers never wait behind a fetch
/// in flight.
struct CacheCell<T> {
    value: Mutex<Option<(T, Instant)>>,
    refresh: tokio::sync::Mutex<()>,
}

impl<T: Clone> CacheCell<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        let slot = self.value.lock().expect("metadata cell lock poisoned");
        slot.as_ref()
            .filter(|(_, at)| at.elapsed() < ttl)
            .map(|(value, _)| value.clone())
    }

    fn store(&self, value: T) {
        let mut slot = self.value.lock().expect("metadata cell lock poisoned");
        *slot = Some((value, Instant::now()));
    }

    fn last(&self) -> Option<T> {
        let slot = self.value.lock().expect("metadata cell lock poisoned");
        slot.as_ref().map(|(value, _)| value.clone())
    }
}

/// Memoized views of cluster and node deployment info.
pub struct CachedMetadata {
    client: ProxyClient,
    ttl: Duration,
    cluster: CacheCell<ClusterDeploymentInfo>,
    node: CacheCell<NodeDeploymentInfo>,
}

impl CachedMetadata {
    /// Create a cache pulling through the given proxy client.
    pub fn new(client: ProxyClient) -> Self {
        Self::with_ttl(client, DEFAULT_METADATA_TTL)
    }

    /// Create a cache with a custom TTL.
    pub fn with_ttl(client: ProxyClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cluster: CacheCell::new(),
            node: CacheCell::new(),
        }
    }

    /// Deployment-wide info, at most `ttl + one in-flight round trip`
    /// old unless marked stale.
    pub async fn cluster_deployment_info(
        &self,
    ) -> Result<Cached<ClusterDeploymentInfo>, ControllerError> {
        self.get_or_refresh(&self.cluster, ClusterRequest::GetClusterDeploymentInfo {
            with_perf: true,
        })
        .await
    }

    /// Per-node info for the answering node.
    pub async fn node_deployment_info(
        &self,
    ) -> Result<Cached<NodeDeploymentInfo>, ControllerError> {
        self.get_or_refresh(&self.node, ClusterRequest::GetNodeDeploymentInfo {
            with_perf: true,
        })
        .await
    }

    async fn get_or_refresh<T>(
        &self,
        cell: &CacheCell<T>,
        request: ClusterRequest,
    ) -> Result<Cached<T>, ControllerError>
    where
        T: Clone + TryFromReply,
    {
        if let Some(value) = cell.fresh(self.ttl) {
            return Ok(Cached {
                value,
                is_stale: false,
            });
        }

        let _refreshing = cell.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(value) = cell.fresh(self.ttl) {
            return Ok(Cached {
                value,
                is_stale: false,
            });
        }

        match self.client.request(request).await {
            Ok(reply) => {
                let value = T::try_from_reply(reply)?;
                cell.store(value.clone());
                Ok(Cached {
                    value,
                    is_stale: false,
                })
            }
            Err(err) => match cell.last() {
                Some(value) => {
                    debug!(error = %err, "metadata refresh failed, serving stale value");
                    Ok(Cached {
                        value,
                        is_stale: true,
                    })
                }
                None => Err(err),
            },
        }
    }
}

/// Conversion from a proxy reply into the cached value type.
trait TryFromReply: Sized {
    fn try_from_reply(reply: ClusterReply) -> Result<Self, ControllerError>;
}

impl TryFromReply for ClusterDeploymentInfo {
    fn try_from_reply(reply: ClusterReply) -> Result<Self, ControllerError> {
        match reply {
            ClusterReply::ClusterInfo(info) => Ok(info),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetClusterDeploymentInfo: {other:?}"
            ))),
        }
    }
}

impl TryFromReply for NodeDeploymentInfo {
    fn try_from_reply(reply: ClusterReply) -> Result<Self, ControllerError> {
        match reply {
            ClusterReply::NodeInfo(info) => Ok(info),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetNodeDeploymentInfo: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::dispatch::FailoverDispatcher;
    use crate::cluster::view::{ClusterView, NodeInfo, NodeRole};
    use crate::runtime::proxy::ProxyDaemon;
    use crate::store::StoreId;
    use crate::transport::channel::InMemoryHub;
    use crate::transport::NodeRef;
    use std::collections::BTreeSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn node(id: &str, port: u16) -> NodeRef {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        NodeRef::new(id, addr)
    }

    fn cluster_info(master: &NodeRef) -> ClusterDeploymentInfo {
        ClusterDeploymentInfo {
            deployment_id: Uuid::new_v4(),
            active: true,
            nodes: vec![NodeInfo::new(master.clone(), NodeRole::Master)],
            replication_factor: 0,
            failover_factor: 0,
            store_id: StoreId::local_fs("/tmp/store"),
            perf: None,
        }
    }

    /// Proxy over a single-master hub whose info handler counts calls.
    fn metadata_fixture(
        ttl: Duration,
    ) -> (Arc<InMemoryHub>, CachedMetadata, Arc<AtomicUsize>, NodeRef) {
        let hub = Arc::new(InMemoryHub::new());
        let master = node("n1", 7001);
        let fetches = Arc::new(AtomicUsize::new(0));

        let info = cluster_info(&master);
        let counter = fetches.clone();
        hub.register(
            master.clone(),
            Arc::new(move |_n, _e| {
                counter.fetch_add(1, Ordering::SeqCst);
                let info = info.clone();
                Box::pin(async move { Ok(ClusterReply::ClusterInfo(info)) })
            }),
        );

        let view = ClusterView::booted(
            Uuid::new_v4(),
            master.clone(),
            Vec::new(),
            BTreeSet::new(),
            0,
            0,
            StoreId::local_fs("/tmp/store"),
        )
        .unwrap();
        let dispatcher = FailoverDispatcher::new(
            hub.clone(),
            Uuid::new_v4(),
            Duration::from_millis(500),
        );
        let (daemon, client) = ProxyDaemon::new(view, dispatcher);
        tokio::spawn(daemon.run(CancellationToken::new()));

        let metadata = CachedMetadata::with_ttl(client, ttl);
        (hub, metadata, fetches, master)
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_without_refetch() {
        let (_hub, metadata, fetches, _master) = metadata_fixture(Duration::from_secs(60));

        let first = metadata.cluster_deployment_info().await.unwrap();
        let second = metadata.cluster_deployment_info().await.unwrap();
        assert!(!first.is_stale);
        assert!(!second.is_stale);
        assert_eq!(first.value.deployment_id, second.value.deployment_id);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let (_hub, metadata, fetches, _master) = metadata_fixture(Duration::from_millis(20));

        metadata.cluster_deployment_info().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        metadata.cluster_deployment_info().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_value() {
        let (hub, metadata, _fetches, master) = metadata_fixture(Duration::from_millis(20));

        let first = metadata.cluster_deployment_info().await.unwrap();
        assert!(!first.is_stale);

        hub.disconnect(&master);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stale = metadata.cluster_deployment_info().await.unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.value.deployment_id, first.value.deployment_id);
    }

    #[tokio::test]
    async fn test_error_propagates_when_never_fetched() {
        let (hub, metadata, _fetches, master) = metadata_fixture(Duration::from_millis(20));
        hub.disconnect(&master);

        let err = metadata.cluster_deployment_info().await.unwrap_err();
        assert!(matches!(err, ControllerError::ClusterUnreachable));
    }
}
