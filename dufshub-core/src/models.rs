use crate::config::{ServiceConfig, ServiceId};
use crate::error::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Lifecycle state of one file-serving service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceState {
    /// A process is (or may still be) attached in these states.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a service's public tunnel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Inactive,
    Connecting,
    Active,
    Error,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Inactive => "inactive",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Error => "error",
        };
        f.write_str(s)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub public_url: Option<String>,
    pub pid: Option<u32>,
    pub last_error: Option<FailureRecord>,
}

/// Runtime view of a service; never persisted.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RuntimeState {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub last_error: Option<FailureRecord>,
    pub local_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub tunnel: TunnelStatus,
}

/// Configuration plus runtime state, as handed to front-ends.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub config: ServiceConfig,
    pub runtime: RuntimeState,
}

/// Minimal listing info for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub id: ServiceId,
    pub name: String,
    pub port: u16,
    pub state: ServiceState,
    pub tunnel: TunnelState,
}

/// Outcome of one service inside a batch start or stop.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItem {
    pub service_id: ServiceId,
    pub name: String,
    pub error: Option<FailureRecord>,
}

/// Per-service results of a batch operation; one failure never aborts the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|item| item.error.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Which child produced a captured line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Tunnel,
    Supervisor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
}
