use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for core operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Machine-readable failure category, rendered by front-ends for targeted guidance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidPath,
    DuplicateName,
    PortUnavailable,
    NoPortAvailable,
    ProcessSpawnFailed,
    ProcessCrashed,
    StopTimedOut,
    BinaryUnavailable,
    TunnelFailed,
    PersistenceError,
    NotFound,
    InvalidState,
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("service name already in use: {0}")]
    DuplicateName(String),
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },
    #[error("no free port in {min}..={max}")]
    NoPortAvailable { min: u16, max: u16 },
    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),
    #[error("process crashed: {0}")]
    ProcessCrashed(String),
    #[error("process did not stop in time: {0}")]
    StopTimedOut(String),
    #[error("tunnel binary unavailable: {0}")]
    BinaryUnavailable(String),
    #[error("tunnel failed: {0}")]
    TunnelFailed(String),
    #[error("failed to persist configuration: {0}")]
    PersistenceError(String),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidPath(_) => ErrorKind::InvalidPath,
            ServiceError::DuplicateName(_) => ErrorKind::DuplicateName,
            ServiceError::PortUnavailable { .. } => ErrorKind::PortUnavailable,
            ServiceError::NoPortAvailable { .. } => ErrorKind::NoPortAvailable,
            ServiceError::ProcessSpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            ServiceError::ProcessCrashed(_) => ErrorKind::ProcessCrashed,
            ServiceError::StopTimedOut(_) => ErrorKind::StopTimedOut,
            ServiceError::BinaryUnavailable(_) => ErrorKind::BinaryUnavailable,
            ServiceError::TunnelFailed(_) => ErrorKind::TunnelFailed,
            ServiceError::PersistenceError(_) => ErrorKind::PersistenceError,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::InvalidState(_) => ErrorKind::InvalidState,
            ServiceError::Io(_) | ServiceError::Serde(_) => ErrorKind::Internal,
        }
    }

    /// Short human-readable text for the failure.
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub(crate) fn record(&self) -> FailureRecord {
        FailureRecord::new(self.kind(), self.message())
    }
}

/// Snapshot of a runtime failure, kept in `RuntimeState::last_error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
