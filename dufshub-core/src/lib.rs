//! Core library for supervising local dufs file servers: configuration
//! storage, port allocation, process lifecycle, public tunnels and events.

mod config;
mod error;
mod events;
mod manager;
mod models;
mod port;
mod process;
mod service;
mod settings;
mod state;
mod store;
mod tunnel;

pub use config::{
    AppState, Auth, ConfigDocument, Permissions, Secret, ServiceConfig, ServiceDefinition,
    ServiceId, SessionState, SCHEMA_VERSION,
};
pub use error::{ErrorKind, FailureRecord, Result, ServiceError};
pub use events::{Event, EventBus, Subscription, Topic};
pub use manager::ServiceManager;
pub use models::{
    BatchItem, BatchReport, LogLine, LogSource, RuntimeState, ServiceSnapshot, ServiceState,
    ServiceSummary, TunnelState, TunnelStatus,
};
pub use port::{is_port_free, local_ip, local_url, PortAllocator, PortPolicy};
pub use process::ProcessTable;
pub use service::{LogBuffer, Service};
pub use settings::{
    Readiness, ServerBinary, Settings, Timeouts, TunnelSettings, CONFIG_FILE_NAME, MAX_LOG_LINES,
};
pub use store::{ConfigStore, SecretCipher};
pub use tunnel::{find_public_url, TunnelInstaller, TunnelManager};
