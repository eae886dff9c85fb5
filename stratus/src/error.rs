//! Controller error taxonomy.
//!
//! Every public operation on the controller either returns a value or
//! fails with exactly one [`ControllerError`] variant. Remote detail is
//! preserved verbatim in [`RemoteErrorInfo`] so callers see what the
//! cluster actually said.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::ProcessId;

/// Error payload returned by a cluster node that handled a request but
/// rejected it.
///
/// The message and optional detail are carried through every layer
/// unmodified. The dispatcher never retries on a remote error: the
/// cluster is reachable, the failure is semantic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorInfo {
    /// Human-readable message from the remote handler.
    pub message: String,
    /// Optional structured detail, passed through verbatim.
    pub detail: Option<String>,
}

impl RemoteErrorInfo {
    /// Create an error info from a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for RemoteErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.message, detail),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors surfaced by the cluster controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Transport could not deliver the message or lost the connection.
    #[error("communication failure: {0}")]
    Communication(String),

    /// No reply arrived within the per-request deadline.
    #[error("request timed out")]
    Timeout,

    /// The current view has no master or alternates to send to.
    #[error("cluster view has no master node")]
    NoMaster,

    /// Every target and every membership probe failed.
    #[error("cluster is unreachable: all master candidates failed")]
    ClusterUnreachable,

    /// The cluster handled the request and returned an error.
    #[error("remote error: {0}")]
    Remote(RemoteErrorInfo),

    /// An operation precondition did not hold; no side effect occurred.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// No process record exists for the given id.
    #[error("no such process: {0}")]
    NoSuchProcess(ProcessId),

    /// The awaited process was killed before producing a result.
    #[error("process {0} was killed")]
    ProcessKilled(ProcessId),

    /// The await deadline elapsed; the remote process keeps running.
    #[error("timed out awaiting result of process {0}")]
    AwaitTimeout(ProcessId),

    /// Static packaging diagnostics contained fatal errors.
    #[error("computation failed to compile: {0}")]
    Compilation(String),

    /// The computation payload could not be serialized.
    #[error("computation is not serializable: {0}")]
    NotSerializable(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request was abandoned because the proxy is terminating.
    #[error("operation cancelled")]
    Cancelled,

    /// The controller has been disposed.
    #[error("controller has been disposed")]
    Disposed,
}

impl ControllerError {
    /// Whether the failure is a transport-level one the dispatcher may
    /// retry against another target.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Communication(_) | ControllerError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_without_detail() {
        let info = RemoteErrorInfo::new("missing dependency: X");
        assert_eq!(info.to_string(), "missing dependency: X");
    }

    #[test]
    fn test_remote_error_display_with_detail() {
        let info = RemoteErrorInfo::new("stage failed").with_detail("assembly a1");
        assert_eq!(info.to_string(), "stage failed (assembly a1)");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ControllerError::Communication("lost".into()).is_retryable());
        assert!(ControllerError::Timeout.is_retryable());
        assert!(!ControllerError::Remote(RemoteErrorInfo::new("boom")).is_retryable());
        assert!(!ControllerError::NoMaster.is_retryable());
        assert!(!ControllerError::Disposed.is_retryable());
    }

    #[test]
    fn test_error_trait_object() {
        let err = ControllerError::Timeout;
        let _: &dyn std::error::Error = &err;
    }
}
