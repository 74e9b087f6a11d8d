//! Optional public exposure of a service through a relay tunnel process.

mod binary;

pub use binary::TunnelInstaller;

use crate::config::ServiceId;
use crate::error::{FailureRecord, Result, ServiceError};
use crate::events::EventBus;
use crate::models::{LogSource, TunnelState, TunnelStatus};
use crate::process::{describe_exit, ProcessTable};
use crate::service::command::piped;
use crate::service::logs::LogSink;
use crate::settings::TunnelSettings;
use crate::state::StateMachine;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::instrument;

#[derive(Debug, Default)]
struct TunnelSlot {
    /// Bumped by every start and stop; background work from an older
    /// generation must not touch state.
    generation: u64,
    pid: Option<u32>,
    public_url: Option<String>,
    last_error: Option<FailureRecord>,
    task: Option<JoinHandle<()>>,
}

/// Tunnel lifecycle for one service.
#[derive(Debug)]
pub struct TunnelManager {
    service_id: ServiceId,
    machine: StateMachine<TunnelState>,
    slot: Mutex<TunnelSlot>,
    installer: Arc<TunnelInstaller>,
    settings: TunnelSettings,
    url_timeout: Duration,
    logs: LogSink,
    processes: ProcessTable,
}

impl TunnelManager {
    pub(crate) fn new(
        service_id: ServiceId,
        bus: EventBus,
        installer: Arc<TunnelInstaller>,
        settings: TunnelSettings,
        url_timeout: Duration,
        logs: LogSink,
        processes: ProcessTable,
    ) -> Self {
        Self {
            machine: StateMachine::new(service_id.clone(), bus),
            service_id,
            slot: Mutex::new(TunnelSlot::default()),
            installer,
            settings,
            url_timeout,
            logs,
            processes,
        }
    }

    fn slot(&self) -> MutexGuard<'_, TunnelSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TunnelState {
        self.machine.current()
    }

    pub fn watch(&self) -> watch::Receiver<TunnelState> {
        self.machine.watch()
    }

    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<TunnelState>
    where
        F: Fn(TunnelState) -> bool,
    {
        self.machine.wait_for(timeout, pred).await
    }

    pub fn status(&self) -> TunnelStatus {
        let slot = self.slot();
        TunnelStatus {
            state: self.machine.current(),
            public_url: slot.public_url.clone(),
            pid: slot.pid,
            last_error: slot.last_error.clone(),
        }
    }

    /// Begin connecting to the relay for the service on `port`.
    ///
    /// Returns once the tunnel is Connecting; binary installation, spawn and
    /// URL discovery continue in the background and are reported as events.
    #[instrument(skip(self), fields(service_id = %self.service_id))]
    pub(crate) fn start(self: &Arc<Self>, port: u16) -> Result<TunnelState> {
        let mut slot = self.slot();
        let current = self.machine.current();
        if matches!(current, TunnelState::Connecting | TunnelState::Active) {
            return Ok(current);
        }
        self.machine.transition(TunnelState::Connecting)?;
        slot.generation += 1;
        slot.pid = None;
        slot.public_url = None;
        slot.last_error = None;
        let generation = slot.generation;
        let this = self.clone();
        slot.task = Some(tokio::spawn(async move { this.run(generation, port).await }));
        Ok(TunnelState::Connecting)
    }

    /// Tear the tunnel down. Safe from any state.
    #[instrument(skip(self), fields(service_id = %self.service_id))]
    pub(crate) fn stop(&self) {
        let mut slot = self.slot();
        slot.generation += 1;
        slot.public_url = None;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if let Some(pid) = slot.pid.take() {
            self.processes.kill_tree(pid);
        }
        if self.machine.current() != TunnelState::Inactive {
            let _ = self.machine.transition(TunnelState::Inactive);
            tracing::info!("tunnel stopped");
        }
    }

    /// Detect a tunnel process that vanished without its exit being observed.
    pub(crate) fn reconcile(&self) -> bool {
        let (generation, pid) = {
            let slot = self.slot();
            (slot.generation, slot.pid)
        };
        let Some(pid) = pid else {
            return false;
        };
        if self.processes.is_alive(pid) {
            return false;
        }
        self.fail(
            generation,
            ServiceError::TunnelFailed("tunnel process disappeared".into()),
        );
        true
    }

    async fn run(self: Arc<Self>, generation: u64, port: u16) {
        let binary = match self.installer.ensure_present().await {
            Ok(path) => path,
            Err(e) => return self.fail(generation, e),
        };

        let local = format!("http://127.0.0.1:{port}");
        let mut cmd = piped(
            &binary,
            &self.settings.leading_args,
            ["tunnel", "--url", local.as_str()],
        );
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ServiceError::TunnelFailed(format!("failed to launch tunnel: {e}"));
                return self.fail(generation, err);
            }
        };

        {
            let mut slot = self.slot();
            if slot.generation != generation {
                return;
            }
            slot.pid = child.id();
        }
        tracing::info!(service_id = %self.service_id, pid = ?child.id(), %local, "tunnel process spawned");

        let (tap, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            self.logs.forward(stdout, LogSource::Tunnel, Some(tap.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.logs.forward(stderr, LogSource::Tunnel, Some(tap));
        }

        let suffix = self.settings.url_suffix.clone();
        let discovered = tokio::time::timeout(self.url_timeout, async {
            while let Some(line) = lines.recv().await {
                if let Some(url) = find_public_url(&line, &suffix) {
                    return Some(url);
                }
            }
            None
        })
        .await;
        drop(lines);

        match discovered {
            Ok(Some(url)) => {
                let mut slot = self.slot();
                if slot.generation != generation {
                    return;
                }
                slot.public_url = Some(url.clone());
                tracing::info!(service_id = %self.service_id, public_url = %url, "tunnel active");
                if !self.machine.transition_from_with(
                    TunnelState::Connecting,
                    TunnelState::Active,
                    Some(url),
                ) {
                    return;
                }
            }
            Ok(None) => {
                let status = child.wait().await;
                let err = ServiceError::TunnelFailed(format!(
                    "tunnel exited before publishing a URL ({})",
                    describe_exit(&status)
                ));
                return self.fail(generation, err);
            }
            Err(_) => {
                let _ = child.start_kill();
                let err = ServiceError::TunnelFailed(format!(
                    "no public URL within {}s",
                    self.url_timeout.as_secs()
                ));
                self.fail(generation, err);
                let _ = child.wait().await;
                return;
            }
        }

        let status = child.wait().await;
        let err = ServiceError::TunnelFailed(format!("tunnel exited ({})", describe_exit(&status)));
        self.fail(generation, err);
    }

    fn fail(&self, generation: u64, err: ServiceError) {
        let mut slot = self.slot();
        if slot.generation != generation {
            return;
        }
        tracing::warn!(service_id = %self.service_id, error = %err, "tunnel failed");
        slot.pid = None;
        slot.public_url = None;
        slot.last_error = Some(err.record());
        if matches!(
            self.machine.current(),
            TunnelState::Connecting | TunnelState::Active
        ) {
            let _ = self.machine.transition(TunnelState::Error);
        }
        self.logs.push(LogSource::Tunnel, err.message());
    }
}

/// First `https://<host><suffix>` URL in `line`, ignoring the relay's own API host.
pub fn find_public_url(line: &str, suffix: &str) -> Option<String> {
    let mut rest = line;
    while let Some(start) = rest.find("https://") {
        let after = &rest[start + "https://".len()..];
        let host_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
            .unwrap_or(after.len());
        let host = &after[..host_len];
        if let Some(label) = host.strip_suffix(suffix) {
            if !label.is_empty() && !label.contains('.') && label != "api" {
                return Some(format!("https://{host}"));
            }
        }
        rest = after;
    }
    None
}
