//! Cloud process management surface.
//!
//! Thin wrappers that prepare a request, submit it through the runtime
//! proxy and interpret the reply. Image validation happens here, before
//! any network traffic.

use tracing::info;

use crate::error::ControllerError;
use crate::package::ComputationImage;
use crate::process::{ProcessHandle, ProcessId, ProcessRecord};
use crate::runtime::proxy::ProxyClient;
use crate::transport::message::{ClusterReply, ClusterRequest};

/// Create/kill/get/list/clear surface for cloud processes.
#[derive(Clone)]
pub struct ProcessManager {
    client: ProxyClient,
}

impl ProcessManager {
    /// Create a manager submitting through the given proxy client.
    pub fn new(client: ProxyClient) -> Self {
        Self { client }
    }

    /// Submit a packaged computation; returns a handle bound to the
    /// cluster-assigned id.
    pub async fn create(
        &self,
        image: ComputationImage,
    ) -> Result<ProcessHandle, ControllerError> {
        let name = image.name.clone();
        match self
            .client
            .request(ClusterRequest::CreateProcess(image))
            .await?
        {
            ClusterReply::ProcessCreated(id) => {
                info!(process = %id, name = %name, "cloud process created");
                Ok(ProcessHandle::new(id, self.client.clone()))
            }
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to CreateProcess: {other:?}"
            ))),
        }
    }

    /// Kill a process by id.
    pub async fn kill(&self, id: ProcessId) -> Result<(), ControllerError> {
        ProcessHandle::new(id, self.client.clone()).kill().await
    }

    /// Resolve a handle from an id, verifying the record exists.
    pub async fn get(&self, id: ProcessId) -> Result<ProcessHandle, ControllerError> {
        let handle = ProcessHandle::new(id, self.client.clone());
        handle.record().await?;
        Ok(handle)
    }

    /// All process records known to the deployment.
    pub async fn get_all(&self) -> Result<Vec<ProcessRecord>, ControllerError> {
        match self.client.request(ClusterRequest::GetAllProcesses).await? {
            ClusterReply::Processes(records) => Ok(records),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to GetAllProcesses: {other:?}"
            ))),
        }
    }

    /// Handles for all known processes.
    pub async fn handles(&self) -> Result<Vec<ProcessHandle>, ControllerError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .map(|record| ProcessHandle::new(record.id, self.client.clone()))
            .collect())
    }

    /// Remove the persisted record of one process.
    ///
    /// Only valid once the process is terminal; checked client-side so
    /// the request carries no side effect on a live process.
    pub async fn clear_info(&self, id: ProcessId) -> Result<(), ControllerError> {
        let record = ProcessHandle::new(id, self.client.clone()).record().await?;
        if !record.status.is_terminal() {
            return Err(ControllerError::Precondition(format!(
                "process {id} is still {:?}; only terminal processes can be cleared",
                record.status
            )));
        }
        self.clear(Some(id)).await
    }

    /// Remove the persisted records of all terminal processes.
    pub async fn clear_all_info(&self) -> Result<(), ControllerError> {
        self.clear(None).await
    }

    async fn clear(&self, id: Option<ProcessId>) -> Result<(), ControllerError> {
        match self
            .client
            .request(ClusterRequest::ClearProcessInfo(id))
            .await?
        {
            ClusterReply::Ack => Ok(()),
            ClusterReply::ProcessNotFound(id) => Err(ControllerError::NoSuchProcess(id)),
            other => Err(ControllerError::Communication(format!(
                "unexpected reply to ClearProcessInfo: {other:?}"
            ))),
        }
    }
}
