//! Client-side handle to a cloud process.
//!
//! A handle is bound to a process id and re-reads the authoritative
//! record through the runtime proxy on every status query. Awaiting a
//! result polls with exponential backoff; the await deadline never
//! cancels the remote process.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ControllerError, RemoteErrorInfo};
use crate::process::{ProcessId, ProcessRecord, ProcessStatus};
use crate::runtime::proxy::ProxyClient;
use crate::transport::message::{ClusterReply, ClusterRequest, LogEntry};

/// Initial delay between result polls.
const POLL_INITIAL: Duration = Duration::from_millis(200);

/// Ceiling for the poll backoff.
const POLL_CAP: Duration = Duration::from_secs(2);

/// Handle to one cloud process.
#[derive(Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    client: ProxyClient,
}

impl ProcessHandle {
    /// Bind a handle to a process id.
    pub(crate) fn new(id: ProcessId, client: ProxyClient) -> Self {
        Self { id, client }
    }

    /// The process id this handle is bound to.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Fetch the current record from the cluster.
    pub async fn record(&self) -> Result<ProcessRecord, ControllerError> {
        match self
            .client
            .request(ClusterRequest::GetProcess(self.id))
            .await?
        {
            ClusterReply::Process(record) => Ok(record),
            ClusterReply::ProcessNotFound(id) => Err(ControllerError::NoSuchProcess(id)),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetProcess: {other:?}"
            ))),
        }
    }

    /// Current lifecycle state, re-read from the cluster.
    pub async fn status(&self) -> Result<ProcessStatus, ControllerError> {
        Ok(self.record().await?.status)
    }

    /// Kill the process.
    pub async fn kill(&self) -> Result<(), ControllerError> {
        match self
            .client
            .request(ClusterRequest::KillProcess(self.id))
            .await?
        {
            ClusterReply::Ack => Ok(()),
            ClusterReply::ProcessNotFound(id) => Err(ControllerError::NoSuchProcess(id)),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to KillProcess: {other:?}"
            ))),
        }
    }

    /// Log entries the cluster accumulated for this process.
    pub async fn logs(&self) -> Result<Vec<LogEntry>, ControllerError> {
        match self
            .client
            .request(ClusterRequest::GetLogDump(Some(self.id)))
            .await?
        {
            ClusterReply::LogDump(entries) => Ok(entries),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetLogDump: {other:?}"
            ))),
        }
    }

    /// Await the serialized result.
    ///
    /// Polls status with exponential backoff between 200 ms and 2 s.
    /// On `Faulted` the remote error surfaces verbatim; on `Killed` the
    /// await fails `ProcessKilled`. When `timeout` elapses the await
    /// fails `AwaitTimeout` without cancelling the remote process.
    pub async fn await_result(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ControllerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = POLL_INITIAL;

        loop {
            let record = self.record().await?;
            match record.status {
                ProcessStatus::Completed => {
                    return record.result.ok_or_else(|| {
                        ControllerError::Communication(
                            "process completed without a result payload".into(),
                        )
                    });
                }
                ProcessStatus::Faulted => {
                    let info = record.error.unwrap_or_else(|| {
                        RemoteErrorInfo::new("process faulted without error detail")
                    });
                    return Err(ControllerError::Remote(info));
                }
                ProcessStatus::Killed => {
                    return Err(ControllerError::ProcessKilled(self.id));
                }
                ProcessStatus::Pending | ProcessStatus::Running => {}
            }

            let sleep = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ControllerError::AwaitTimeout(self.id));
                    }
                    backoff.min(deadline - now)
                }
                None => backoff,
            };
            debug!(process = %self.id, status = ?record.status, ?sleep, "result not ready, backing off");
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(POLL_CAP);
        }
    }

    /// Await the result and decode it.
    pub async fn await_result_as<T: DeserializeOwned>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<T, ControllerError> {
        let bytes = self.await_result(timeout).await?;
        bincode::deserialize(&bytes)
            .map_err(|e| ControllerError::Communication(format!("undecodable result: {e}")))
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("id", &self.id).finish()
    }
}
