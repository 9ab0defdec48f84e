use thiserror::Error;

/// Failures reported by a transfer engine adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid resource identifier: {0}")]
    InvalidResourceIdentifier(String),
    #[error("transfer engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("cancel failed: {reason}")]
    CancelFailed { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a job is already active")]
    AlreadyActive,
}

/// Synchronous outcome of a rejected control request. `Display` is the wire error string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("resourceId required")]
    MissingResourceId,
    #[error("invalid resource identifier")]
    InvalidResourceIdentifier,
    #[error("a job is already active")]
    AlreadyActive,
    #[error("no active job")]
    NoActiveJob,
    #[error("cancel failed: {0}")]
    CancelFailed(String),
    #[error("transfer engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl ControlError {
    /// Client-side rejections as opposed to server faults.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::CancelFailed(_) | Self::EngineUnavailable(_))
    }
}

impl From<RegistryError> for ControlError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyActive => Self::AlreadyActive,
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidResourceIdentifier(_) => Self::InvalidResourceIdentifier,
            EngineError::EngineUnavailable(reason) => Self::EngineUnavailable(reason),
            EngineError::CancelFailed { reason } => Self::CancelFailed(reason),
        }
    }
}
