//! One supervised file-server process and its optional tunnel.

pub(crate) mod command;
mod lifecycle;
pub(crate) mod logs;

pub use logs::LogBuffer;

use crate::config::{ServiceConfig, ServiceId};
use crate::error::FailureRecord;
use crate::events::EventBus;
use crate::models::{LogLine, RuntimeState, ServiceSnapshot, ServiceState, TunnelState};
use crate::process::ProcessTable;
use crate::settings::{Settings, MAX_LOG_LINES};
use crate::state::StateMachine;
use crate::tunnel::{TunnelInstaller, TunnelManager};
use chrono::{DateTime, Utc};
use logs::LogSink;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Process bookkeeping guarded together with monitor-side transitions.
#[derive(Debug, Default)]
struct ProcessSlot {
    /// Bumped on every spawn and forced stop; a monitor only acts on its own generation.
    generation: u64,
    pid: Option<u32>,
    last_error: Option<FailureRecord>,
    local_url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    /// State the reconciler saw when it declared the current process gone,
    /// before the monitor reported the real exit.
    presumed_exit: Option<ServiceState>,
}

#[derive(Debug)]
pub struct Service {
    id: ServiceId,
    config: RwLock<ServiceConfig>,
    slot: Mutex<ProcessSlot>,
    machine: StateMachine<ServiceState>,
    logs: LogSink,
    tunnel: Arc<TunnelManager>,
    /// Orders start/stop/restart requests for this service.
    op: tokio::sync::Mutex<()>,
    settings: Arc<Settings>,
    processes: ProcessTable,
}

impl Service {
    pub(crate) fn new(
        config: ServiceConfig,
        settings: Arc<Settings>,
        bus: EventBus,
        installer: Arc<TunnelInstaller>,
        processes: ProcessTable,
    ) -> Arc<Self> {
        let id = config.id.clone();
        let logs = LogSink::new(id.clone(), Arc::new(LogBuffer::new(MAX_LOG_LINES)), bus.clone());
        let tunnel = Arc::new(TunnelManager::new(
            id.clone(),
            bus.clone(),
            installer,
            settings.tunnel.clone(),
            settings.timeouts.tunnel_url,
            logs.clone(),
            processes.clone(),
        ));
        Arc::new(Self {
            machine: StateMachine::new(id.clone(), bus),
            id,
            config: RwLock::new(config),
            slot: Mutex::new(ProcessSlot::default()),
            logs,
            tunnel,
            op: tokio::sync::Mutex::new(()),
            settings,
            processes,
        })
    }

    fn slot(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn config(&self) -> ServiceConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_config(&self, config: ServiceConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn name(&self) -> String {
        self.config.read().unwrap_or_else(|e| e.into_inner()).name.clone()
    }

    pub fn port(&self) -> u16 {
        self.config.read().unwrap_or_else(|e| e.into_inner()).port
    }

    pub fn state(&self) -> ServiceState {
        self.machine.current()
    }

    pub fn watch(&self) -> watch::Receiver<ServiceState> {
        self.machine.watch()
    }

    /// Wait until the state satisfies `pred`; `None` on timeout.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<ServiceState>
    where
        F: Fn(ServiceState) -> bool,
    {
        self.machine.wait_for(timeout, pred).await
    }

    pub fn tunnel(&self) -> &Arc<TunnelManager> {
        &self.tunnel
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot().pid
    }

    pub fn last_error(&self) -> Option<FailureRecord> {
        self.slot().last_error.clone()
    }

    pub fn runtime(&self) -> RuntimeState {
        let slot = self.slot();
        RuntimeState {
            state: self.machine.current(),
            pid: slot.pid,
            last_error: slot.last_error.clone(),
            local_url: slot.local_url.clone(),
            started_at: slot.started_at,
            tunnel: self.tunnel.status(),
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            config: self.config(),
            runtime: self.runtime(),
        }
    }

    pub fn logs(&self, lines: usize) -> Vec<LogLine> {
        self.logs.buffer().tail(lines)
    }

    pub fn clear_logs(&self) {
        self.logs.buffer().clear();
    }
}
