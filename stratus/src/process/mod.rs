//! Cloud process records and client-side handles.
//!
//! A cloud process is a user-submitted computation executing across the
//! cluster. The authoritative record lives in cluster-side storage; the
//! client holds a [`ProcessHandle`] that re-reads status on demand and
//! a [`ProcessManager`] for the create/kill/list/clear surface.

pub mod handle;
pub mod manager;

pub use handle::ProcessHandle;
pub use manager::ProcessManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteErrorInfo;

/// Identifier of a cloud process, assigned by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Wrap a raw uuid.
    pub fn from_uuid(id: Uuid) -> Self {
        ProcessId(id)
    }

    /// The raw uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a cloud process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Accepted, not yet scheduled.
    Pending,
    /// Executing on the cluster.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Faulted,
    /// Terminated by a kill request.
    Killed,
}

impl ProcessStatus {
    /// Whether the process can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Faulted | ProcessStatus::Killed
        )
    }
}

/// Authoritative record of a cloud process, as reported by the cluster.
///
/// Mutable only on the cluster side; the client treats every received
/// record as a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Cluster-assigned identifier.
    pub id: ProcessId,
    /// Image name the process was created from.
    pub name: String,
    /// Return type tag of the computation.
    pub return_type_tag: String,
    /// Current lifecycle state.
    pub status: ProcessStatus,
    /// Serialized result, present once `Completed`.
    pub result: Option<Vec<u8>>,
    /// Failure detail, present once `Faulted`.
    pub error: Option<RemoteErrorInfo>,
    /// When the cluster accepted the process.
    pub created_at: DateTime<Utc>,
    /// When the process reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Faulted.is_terminal());
        assert!(ProcessStatus::Killed.is_terminal());
    }

    #[test]
    fn test_process_id_display_matches_uuid() {
        let raw = Uuid::new_v4();
        let id = ProcessId::from_uuid(raw);
        assert_eq!(id.to_string(), raw.to_string());
        assert_eq!(id.as_uuid(), raw);
    }
}
