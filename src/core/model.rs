use crate::plugins::transfer::TransferControl;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Active,
    /// Cancel requested, waiting for the engine to confirm.
    Terminating,
}

/// The single transfer occupying the registry slot.
pub struct Job {
    pub id: JobId,
    pub resource_id: String,
    pub destination: PathBuf,
    pub display_name: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub rate_bytes_per_sec: u64,
    pub state: JobState,
    /// Attached once the engine has handed back a handle.
    pub control: Option<Arc<dyn TransferControl>>,
    pub lease: JobLease,
}

/// Signals shared between a job's slot entry and its driving task.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub id: JobId,
    pub cancel_requested: CancellationToken,
    pub released: CancellationToken,
}

impl JobLease {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            cancel_requested: CancellationToken::new(),
            released: CancellationToken::new(),
        }
    }
}

impl Job {
    pub fn new(resource_id: String, destination: PathBuf) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            resource_id,
            destination,
            display_name: None,
            bytes_transferred: 0,
            total_bytes: None,
            rate_bytes_per_sec: 0,
            state: JobState::Active,
            control: None,
            lease: JobLease::new(id),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            resource_id: self.resource_id.clone(),
            destination: self.destination.clone(),
            name: self.display_name.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            rate_per_sec: self.rate_bytes_per_sec,
            state: self.state,
        }
    }

    /// Fraction in [0, 1]; zero while the total is unknown.
    pub fn progress_fraction(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_transferred as f64 / total as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("resource_id", &self.resource_id)
            .field("state", &self.state)
            .field("bytes_transferred", &self.bytes_transferred)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Read-only copy of the active job, safe to hand out of the registry lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub resource_id: String,
    pub destination: PathBuf,
    pub name: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub rate_per_sec: u64,
    pub state: JobState,
}
