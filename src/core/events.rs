use crate::core::model::Job;
use serde::Serialize;

/// Lifecycle events emitted by a transfer handle, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Metadata { name: String, total_bytes: Option<u64> },
    Progress { bytes_transferred: u64, total_bytes: Option<u64>, rate_bytes_per_sec: u64 },
    Completed,
    Failed { reason: String },
    /// Engine confirmed a requested cancellation.
    Cancelled,
    CancelFailed { reason: String },
}

/// Messages pushed to telemetry observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Progress(ProgressEvent),
    Done(DoneEvent),
    Cancelled(CancelledEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub progress_percent: f64,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub rate_per_sec: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoneEvent {
    pub message: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelledEvent {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub message: String,
}

impl TelemetryEvent {
    pub fn progress(job: &Job) -> Self {
        let percent = (job.progress_fraction() * 10_000.0).round() / 100.0;
        Self::Progress(ProgressEvent {
            progress_percent: percent,
            bytes_transferred: job.bytes_transferred,
            total_bytes: job.total_bytes,
            rate_per_sec: job.rate_bytes_per_sec,
            name: job.display_name.clone(),
        })
    }

    pub fn done(job: &Job) -> Self {
        let name = job.display_name.clone().unwrap_or_else(|| job.resource_id.clone());
        Self::Done(DoneEvent { message: format!("Download complete: {}", name), name })
    }

    pub fn cancelled() -> Self {
        Self::Cancelled(CancelledEvent { message: "Transfer cancelled.".to_string() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent { message: message.into() })
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Done(_) => "done",
            Self::Cancelled(_) => "cancelled",
            Self::Error(_) => "error",
        }
    }
}
