//! Pooled TCP transport.
//!
//! Frames are length-delimited ([`LengthDelimitedCodec`]) with
//! bincode-encoded payloads: a [`RequestEnvelope`] out, a
//! [`ClusterReply`] back. One connection per node is kept in a
//! process-wide pool; a connection is dropped from the pool on any I/O
//! error or timeout, so the next attempt reconnects from scratch. The
//! pool is hidden behind [`NodeRef`] addressing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::transport::message::{ClusterReply, RequestEnvelope};
use crate::transport::{NodeRef, Transport, TransportError, TransportFuture};

/// Default timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frame size accepted from a node (16 MiB). Bounded so a
/// misbehaving peer cannot exhaust client memory.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP implementation of [`Transport`] with per-node pooled
/// connections.
pub struct TcpTransport {
    pool: DashMap<NodeRef, Arc<Mutex<Connection>>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport with the default connect timeout.
    pub fn new() -> Self {
        Self {
            pool: DashMap::new(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Number of pooled connections, for diagnostics.
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec()
    }

    async fn connection(&self, target: &NodeRef) -> Result<Arc<Mutex<Connection>>, TransportError> {
        if let Some(conn) = self.pool.get(target) {
            return Ok(conn.clone());
        }

        debug!(node = %target, "opening connection");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.addr()))
            .await
            .map_err(|_| TransportError::communication(target, "connect timed out"))?
            .map_err(|e| TransportError::communication(target, e.to_string()))?;

        let conn = Arc::new(Mutex::new(Framed::new(stream, Self::codec())));
        self.pool.insert(target.clone(), conn.clone());
        Ok(conn)
    }

    /// Drop a node's pooled connection so the next attempt reconnects.
    fn invalidate(&self, target: &NodeRef) {
        self.pool.remove(target);
    }

    async fn exchange(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ClusterReply, TransportError> {
        let frame = bincode::serialize(&envelope)
            .map_err(|e| TransportError::communication(target, e.to_string()))?;

        let conn = self.connection(target).await?;
        let mut conn = conn.lock().await;

        if let Err(e) = conn.send(Bytes::from(frame)).await {
            self.invalidate(target);
            return Err(TransportError::communication(target, e.to_string()));
        }

        // A timed-out reply leaves an unconsumed frame on the stream,
        // which would desynchronize the next exchange. Invalidate.
        let next = match tokio::time::timeout(timeout, conn.next()).await {
            Ok(next) => next,
            Err(_) => {
                self.invalidate(target);
                return Err(TransportError::Timeout {
                    node: target.to_string(),
                    timeout,
                });
            }
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                self.invalidate(target);
                return Err(TransportError::communication(target, e.to_string()));
            }
            None => {
                self.invalidate(target);
                return Err(TransportError::communication(target, "connection closed"));
            }
        };

        let reply: ClusterReply = bincode::deserialize(&frame)
            .map_err(|e| TransportError::communication(target, e.to_string()))?;

        match reply {
            ClusterReply::Error(info) => Err(TransportError::Remote {
                node: target.to_string(),
                info,
            }),
            reply => Ok(reply),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn send(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
    ) -> TransportFuture<'_, Result<(), TransportError>> {
        let target = target.clone();
        Box::pin(async move {
            let frame = bincode::serialize(&envelope)
                .map_err(|e| TransportError::communication(&target, e.to_string()))?;
            let conn = self.connection(&target).await?;
            let mut conn = conn.lock().await;
            if let Err(e) = conn.send(Bytes::from(frame)).await {
                self.invalidate(&target);
                return Err(TransportError::communication(&target, e.to_string()));
            }
            Ok(())
        })
    }

    fn request(
        &self,
        target: &NodeRef,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> TransportFuture<'_, Result<ClusterReply, TransportError>> {
        let target = target.clone();
        Box::pin(async move { self.exchange(&target, envelope, timeout).await })
    }
}
