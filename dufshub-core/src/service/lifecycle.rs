//! Start, stop and supervision of the file-server child.

use super::*;
use crate::error::{Result, ServiceError};
use crate::models::LogSource;
use crate::port::{ensure_bindable, local_url};
use crate::process::describe_exit;
use crate::settings::Readiness;
use std::process::ExitStatus;
use tokio::sync::mpsc;
use tracing::instrument;

/// Output fragments the server prints when its port is taken.
const ADDR_IN_USE_MARKERS: &[&str] = &[
    "address in use",
    "address already in use",
    "os error 98",
    "os error 10048",
];

/// How long the monitor waits for trailing output after the child exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

impl Service {
    /// Spawn the server. Returns once the service is Starting; readiness is
    /// reported by a later Running (or Error) transition.
    ///
    /// Starting, Running and Stopping services are left alone and their
    /// current state is returned.
    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn start(self: &Arc<Self>) -> Result<ServiceState> {
        let _op = self.op.lock().await;
        self.start_locked()
    }

    /// Terminate the server (gracefully, then by force) and its tunnel.
    /// Stopping a Stopped service succeeds without doing anything.
    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn stop(&self) -> Result<()> {
        let _op = self.op.lock().await;
        self.stop_locked().await
    }

    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn restart(self: &Arc<Self>) -> Result<ServiceState> {
        let _op = self.op.lock().await;
        let current = self.machine.current();
        if !matches!(current, ServiceState::Running | ServiceState::Error) {
            return Err(ServiceError::InvalidState(format!(
                "cannot restart a {current} service"
            )));
        }
        if current == ServiceState::Error {
            self.reap_leftover().await;
        } else {
            self.stop_locked().await?;
        }
        self.start_locked()
    }

    /// Clear an Error back to Stopped without restarting.
    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn acknowledge(&self) -> Result<ServiceState> {
        let _op = self.op.lock().await;
        match self.machine.current() {
            ServiceState::Error => {
                self.acknowledge_error();
                Ok(ServiceState::Stopped)
            }
            ServiceState::Stopped => Ok(ServiceState::Stopped),
            other => Err(ServiceError::InvalidState(format!(
                "cannot acknowledge a {other} service"
            ))),
        }
    }

    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn enable_tunnel(&self) -> Result<TunnelState> {
        let _op = self.op.lock().await;
        let current = self.machine.current();
        if current != ServiceState::Running {
            return Err(ServiceError::InvalidState(format!(
                "tunnel needs a running service, this one is {current}"
            )));
        }
        self.tunnel.start(self.port())
    }

    #[instrument(skip(self), fields(service_id = %self.id))]
    pub async fn disable_tunnel(&self) {
        let _op = self.op.lock().await;
        self.tunnel.stop();
    }

    /// Swap in the configuration `build` derives from the current one. Only a
    /// Stopped service can be reconfigured, and no start can interleave.
    pub(crate) async fn reconfigure<F>(&self, build: F) -> Result<ServiceConfig>
    where
        F: FnOnce(&ServiceConfig) -> Result<ServiceConfig>,
    {
        let _op = self.op.lock().await;
        let state = self.machine.current();
        if state != ServiceState::Stopped {
            return Err(ServiceError::InvalidState(format!(
                "service must be stopped to edit (currently {state})"
            )));
        }
        let config = build(&self.config())?;
        self.replace_config(config.clone());
        Ok(config)
    }

    /// Compare believed state with the OS and repair it. Returns true when
    /// anything changed.
    pub(crate) fn reconcile(&self) -> bool {
        let (generation, pid) = {
            let slot = self.slot();
            (slot.generation, slot.pid)
        };
        let mut changed = false;
        if self.machine.current().is_active() {
            if let Some(pid) = pid.filter(|pid| !self.processes.is_alive(*pid)) {
                tracing::warn!(service_id = %self.id, pid, "server process vanished");
                let lost = std::io::Error::new(std::io::ErrorKind::Other, "process vanished");
                self.on_exit(generation, Err(lost), false);
                changed = true;
            }
        }
        if self.tunnel.reconcile() {
            changed = true;
        }
        if self.machine.current() != ServiceState::Running
            && self.tunnel.state() != TunnelState::Inactive
        {
            self.tunnel.stop();
            changed = true;
        }
        changed
    }

    /// Kill whatever is left of this service, without waiting.
    pub(crate) fn force_kill(&self) {
        self.tunnel.stop();
        let pid = self.slot().pid;
        if let Some(pid) = pid {
            tracing::warn!(service_id = %self.id, pid, "force-killing server");
            self.processes.kill_tree(pid);
        }
    }

    fn start_locked(self: &Arc<Self>) -> Result<ServiceState> {
        let current = self.machine.current();
        if matches!(
            current,
            ServiceState::Starting | ServiceState::Running | ServiceState::Stopping
        ) {
            tracing::debug!(service_id = %self.id, state = %current, "start ignored");
            return Ok(current);
        }

        let config = self.config();
        if !config.root_path.is_dir() {
            return Err(ServiceError::InvalidPath(format!(
                "{} no longer exists",
                config.root_path.display()
            )));
        }
        self.settings.ports.check(config.port)?;
        ensure_bindable(config.port)?;

        self.machine.transition(ServiceState::Starting)?;
        let (mut cmd, shown) = command::server_command(&self.settings.server, &config);
        tracing::info!(service_id = %self.id, command = %shown, "spawning file server");
        self.logs.push(LogSource::Supervisor, format!("starting: {shown}"));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ServiceError::ProcessSpawnFailed(format!(
                    "{}: {e}",
                    self.settings.server.program.display()
                ));
                {
                    let mut slot = self.slot();
                    slot.last_error = Some(err.record());
                    self.machine
                        .transition_from(ServiceState::Starting, ServiceState::Error);
                }
                self.logs.push(LogSource::Supervisor, err.message());
                return Err(err);
            }
        };

        let generation = {
            let mut slot = self.slot();
            slot.generation += 1;
            slot.pid = child.id();
            slot.local_url = None;
            slot.started_at = None;
            slot.presumed_exit = None;
            slot.generation
        };

        let (tap, lines) = match &self.settings.readiness {
            Readiness::OutputContains(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            _ => (None, None),
        };
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.logs.forward(stdout, LogSource::Stdout, tap.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.logs.forward(stderr, LogSource::Stderr, tap));
        }

        let this = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let drain = futures::future::join_all(readers);
            let _ = tokio::time::timeout(OUTPUT_DRAIN, drain).await;
            this.on_exit(generation, status, true);
        });

        let this = self.clone();
        tokio::spawn(async move { this.await_readiness(generation, config, lines).await });

        Ok(ServiceState::Starting)
    }

    async fn stop_locked(&self) -> Result<()> {
        self.tunnel.stop();

        let mut current = self.machine.current();
        if current == ServiceState::Starting {
            let settle = self.settings.timeouts.readiness + Duration::from_secs(1);
            current = self
                .machine
                .wait_for(settle, |s| s != ServiceState::Starting)
                .await
                .unwrap_or(ServiceState::Starting);
            if current == ServiceState::Starting {
                let generation = self.slot().generation;
                self.readiness_timed_out(generation);
                current = self.machine.current();
            }
        }

        match current {
            ServiceState::Stopped => return Ok(()),
            ServiceState::Error => {
                self.acknowledge_error();
                return Ok(());
            }
            ServiceState::Running | ServiceState::Stopping | ServiceState::Starting => {}
        }

        let (generation, pid) = {
            let slot = self.slot();
            (slot.generation, slot.pid)
        };
        if current == ServiceState::Running
            && !self
                .machine
                .transition_from(ServiceState::Running, ServiceState::Stopping)
        {
            // exited between the check and the transition
            self.acknowledge_error();
            return Ok(());
        }

        self.logs.push(LogSource::Supervisor, "stopping");
        if let Some(pid) = pid {
            if !self.processes.terminate(pid) {
                self.processes.kill_tree(pid);
            }
        }

        let timeouts = self.settings.timeouts;
        let stopped = |s: ServiceState| s == ServiceState::Stopped;
        if self.machine.wait_for(timeouts.stop_grace, stopped).await.is_some() {
            return Ok(());
        }

        tracing::warn!(service_id = %self.id, ?pid, "graceful stop timed out, killing process tree");
        if let Some(pid) = pid {
            self.processes.kill_tree(pid);
        }
        if self.machine.wait_for(timeouts.kill_wait, stopped).await.is_some() {
            return Ok(());
        }

        let err = ServiceError::StopTimedOut(format!("pid {pid:?} survived a forced kill"));
        {
            let mut slot = self.slot();
            if slot.generation == generation {
                slot.generation += 1;
                slot.pid = None;
                slot.local_url = None;
                slot.started_at = None;
            }
            slot.last_error = Some(err.record());
            self.machine
                .transition_from(ServiceState::Stopping, ServiceState::Stopped);
        }
        tracing::error!(service_id = %self.id, error = %err, "stop gave up");
        self.logs.push(LogSource::Supervisor, err.message());
        Err(err)
    }

    fn acknowledge_error(&self) {
        let _slot = self.slot();
        if self
            .machine
            .transition_from(ServiceState::Error, ServiceState::Stopped)
        {
            tracing::info!(service_id = %self.id, "error acknowledged");
        }
    }

    /// Kill a process an Error left behind and give it a moment to release the port.
    async fn reap_leftover(&self) {
        self.tunnel.stop();
        let pid = self.slot().pid;
        let Some(pid) = pid else {
            return;
        };
        self.processes.kill_tree(pid);
        let deadline = tokio::time::Instant::now() + self.settings.timeouts.kill_wait;
        while self.processes.is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn await_readiness(
        self: Arc<Self>,
        generation: u64,
        config: ServiceConfig,
        lines: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let timeout = self.settings.timeouts.readiness;
        let probe = async {
            match self.settings.readiness.clone() {
                Readiness::Grace(grace) => {
                    tokio::time::sleep(grace).await;
                    true
                }
                Readiness::TcpConnect => {
                    let host = probe_host(config.bind.as_deref());
                    loop {
                        if !self.is_starting(generation) {
                            return false;
                        }
                        if tokio::net::TcpStream::connect((host.as_str(), config.port))
                            .await
                            .is_ok()
                        {
                            return true;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                Readiness::OutputContains(pattern) => {
                    let Some(mut lines) = lines else {
                        return false;
                    };
                    while let Some(line) = lines.recv().await {
                        if line.contains(&pattern) {
                            return true;
                        }
                    }
                    false
                }
            }
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(true) => self.mark_running(generation, config.port),
            Ok(false) => {}
            Err(_) => self.readiness_timed_out(generation),
        }
    }

    fn is_starting(&self, generation: u64) -> bool {
        self.slot().generation == generation && self.machine.current() == ServiceState::Starting
    }

    fn mark_running(&self, generation: u64, port: u16) {
        let url = local_url(port);
        let mut slot = self.slot();
        if slot.generation != generation {
            return;
        }
        if let Some(pid) = slot.pid {
            if !self.processes.is_alive(pid) {
                return;
            }
        }
        if self
            .machine
            .transition_from(ServiceState::Starting, ServiceState::Running)
        {
            slot.last_error = None;
            slot.local_url = Some(url.clone());
            slot.started_at = Some(Utc::now());
            drop(slot);
            tracing::info!(service_id = %self.id, local_url = %url, "service running");
        }
    }

    fn readiness_timed_out(&self, generation: u64) {
        let timeout = self.settings.timeouts.readiness;
        let pid = {
            let mut slot = self.slot();
            if slot.generation != generation || self.machine.current() != ServiceState::Starting {
                return;
            }
            let err = ServiceError::ProcessSpawnFailed(format!(
                "server not ready within {}s",
                timeout.as_secs()
            ));
            slot.last_error = Some(err.record());
            self.machine
                .transition_from(ServiceState::Starting, ServiceState::Error);
            self.logs.push(LogSource::Supervisor, err.message());
            slot.pid
        };
        tracing::warn!(service_id = %self.id, ?pid, "readiness timed out");
        if let Some(pid) = pid {
            self.processes.kill_tree(pid);
        }
    }

    /// `observed` is false when the reconciler infers the exit from a missing
    /// pid. The monitor's later report then replaces the inferred error.
    fn on_exit(&self, generation: u64, status: std::io::Result<ExitStatus>, observed: bool) {
        let detail = describe_exit(&status);
        let tail = self.logs.output_tail(8);
        let port = self.port();
        let failure = {
            let mut slot = self.slot();
            if slot.generation != generation {
                tracing::debug!(service_id = %self.id, "exit of a superseded process");
                return;
            }
            if observed {
                if let Some(was) = slot.presumed_exit.take() {
                    if self.machine.current() == ServiceState::Error {
                        slot.last_error = Some(exit_error(was, port, &detail, &tail).record());
                    }
                    drop(slot);
                    self.logs
                        .push(LogSource::Supervisor, format!("process exited ({detail})"));
                    return;
                }
            }
            slot.pid = None;
            slot.local_url = None;
            slot.started_at = None;
            match self.machine.current() {
                current @ (ServiceState::Starting | ServiceState::Running) => {
                    let err = exit_error(current, port, &detail, &tail);
                    slot.last_error = Some(err.record());
                    self.machine.transition_from(current, ServiceState::Error);
                    if !observed {
                        slot.presumed_exit = Some(current);
                    }
                    Some(err)
                }
                ServiceState::Stopping => {
                    self.machine
                        .transition_from(ServiceState::Stopping, ServiceState::Stopped);
                    None
                }
                ServiceState::Stopped | ServiceState::Error => None,
            }
        };

        self.logs
            .push(LogSource::Supervisor, format!("process exited ({detail})"));
        if let Some(err) = failure {
            tracing::warn!(service_id = %self.id, error = %err, "server exited unexpectedly");
            self.tunnel.stop();
        } else {
            tracing::info!(service_id = %self.id, %detail, "server exited");
        }
    }
}

/// Failure for a process that exited while in `was`.
fn exit_error(was: ServiceState, port: u16, detail: &str, tail: &str) -> ServiceError {
    if was == ServiceState::Starting {
        classify_startup_exit(port, detail, tail)
    } else {
        ServiceError::ProcessCrashed(with_tail(detail, tail))
    }
}

fn probe_host(bind: Option<&str>) -> String {
    match bind.map(str::trim) {
        None | Some("") | Some("0.0.0.0") | Some("::") | Some("[::]") => "127.0.0.1".into(),
        Some(addr) => addr.to_string(),
    }
}

fn with_tail(detail: &str, tail: &str) -> String {
    if tail.is_empty() {
        detail.to_string()
    } else {
        format!("{detail}: {tail}")
    }
}

fn classify_startup_exit(port: u16, detail: &str, tail: &str) -> ServiceError {
    let lowered = tail.to_lowercase();
    if ADDR_IN_USE_MARKERS.iter().any(|m| lowered.contains(m)) {
        ServiceError::PortUnavailable {
            port,
            reason: "address already in use".into(),
        }
    } else {
        ServiceError::ProcessCrashed(format!("exited during startup ({})", with_tail(detail, tail)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ServiceDefinition, ServiceId};
    use crate::error::ErrorKind;
    use crate::settings::ServerBinary;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn service(dir: &TempDir, script: &str, readiness: Readiness) -> Arc<Service> {
        service_on(dir, script, readiness, EventBus::new())
    }

    fn service_on(dir: &TempDir, script: &str, readiness: Readiness, bus: EventBus) -> Arc<Service> {
        let mut settings = Settings::with_data_dir(dir.path());
        settings.server = ServerBinary::new("/bin/sh").with_args(["-c", script, "sh"]);
        settings.readiness = readiness;
        settings.timeouts.readiness = Duration::from_secs(5);
        settings.timeouts.stop_grace = Duration::from_millis(500);
        settings.tunnel.download_url = "http://127.0.0.1:1/cloudflared".into();
        let settings = Arc::new(settings);

        let root = dir.path().join("www");
        std::fs::create_dir_all(&root).unwrap();
        let def = ServiceDefinition::new("docs", root);
        let config = ServiceConfig::from_definition(ServiceId::generate(), def, free_port());
        let installer = Arc::new(TunnelInstaller::new(
            &settings.tunnel.binary_path,
            settings.tunnel.download_url.clone(),
            Duration::from_secs(2),
        ));
        Service::new(config, settings, bus, installer, ProcessTable::new())
    }

    const SERVE: &str = r#"echo "Listening on http://127.0.0.1:$3"; exec sleep 30"#;

    fn ready_on_output() -> Readiness {
        Readiness::OutputContains("Listening on".into())
    }

    async fn until(svc: &Service, state: ServiceState) -> Option<ServiceState> {
        svc.wait_for(Duration::from_secs(5), |s| s == state).await
    }

    #[tokio::test]
    async fn start_then_stop() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());

        assert_eq!(svc.start().await.unwrap(), ServiceState::Starting);
        assert_eq!(until(&svc, ServiceState::Running).await, Some(ServiceState::Running));
        let runtime = svc.runtime();
        assert!(runtime.pid.is_some());
        assert!(runtime.local_url.is_some());
        assert!(runtime.last_error.is_none());

        // a second start is a no-op
        assert_eq!(svc.start().await.unwrap(), ServiceState::Running);

        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert!(svc.pid().is_none());
    }

    #[tokio::test]
    async fn grace_readiness() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, Readiness::Grace(Duration::from_millis(200)));
        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Running).await, Some(ServiceState::Running));
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        svc.stop().await.unwrap();
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn missing_root_is_invalid_path() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        std::fs::remove_dir_all(&svc.config().root_path).unwrap();

        let err = svc.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn bound_port_is_rejected_at_start() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        let _holder = std::net::TcpListener::bind(("0.0.0.0", svc.port())).unwrap();

        let err = svc.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortUnavailable);
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn crash_while_running_is_recorded() {
        let dir = TempDir::new().unwrap();
        let script = "echo up; sleep 0.3; echo 'disk on fire' >&2; exit 3";
        let svc = service(&dir, script, Readiness::OutputContains("up".into()));

        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Running).await, Some(ServiceState::Running));
        assert_eq!(until(&svc, ServiceState::Error).await, Some(ServiceState::Error));

        let error = svc.last_error().unwrap();
        assert_eq!(error.kind, ErrorKind::ProcessCrashed);
        assert!(error.message.contains("exit status: 3"));
        assert!(error.message.contains("disk on fire"));
        assert!(svc.pid().is_none());
        assert_eq!(svc.tunnel_state(), TunnelState::Inactive);
    }

    #[tokio::test]
    async fn address_in_use_output_maps_to_port_unavailable() {
        let dir = TempDir::new().unwrap();
        let script = "echo 'error: Address already in use (os error 98)' >&2; exit 1";
        let svc = service(&dir, script, ready_on_output());

        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Error).await, Some(ServiceState::Error));
        assert_eq!(svc.last_error().unwrap().kind, ErrorKind::PortUnavailable);

        // stop acknowledges the error
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn readiness_timeout_kills_and_errors() {
        let dir = TempDir::new().unwrap();
        let svc = {
            let mut settings = Settings::with_data_dir(dir.path());
            settings.server = ServerBinary::new("/bin/sh").with_args(["-c", "exec sleep 30", "sh"]);
            settings.readiness = Readiness::OutputContains("never printed".into());
            settings.timeouts.readiness = Duration::from_millis(300);
            let settings = Arc::new(settings);
            let def = ServiceDefinition::new("slow", dir.path());
            let config = ServiceConfig::from_definition(ServiceId::generate(), def, free_port());
            let installer = Arc::new(TunnelInstaller::new(
                &settings.tunnel.binary_path,
                "http://127.0.0.1:1/x",
                Duration::from_secs(1),
            ));
            Service::new(config, settings, EventBus::new(), installer, ProcessTable::new())
        };

        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Error).await, Some(ServiceState::Error));
        assert_eq!(svc.last_error().unwrap().kind, ErrorKind::ProcessSpawnFailed);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let dir = TempDir::new().unwrap();
        let script = "trap '' TERM; echo ready; while true; do sleep 0.1; done";
        let svc = service(&dir, script, Readiness::OutputContains("ready".into()));

        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Running).await, Some(ServiceState::Running));

        let begun = std::time::Instant::now();
        svc.stop().await.unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(500));
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn restart_requires_running_or_error() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        let err = svc.restart().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        svc.start().await.unwrap();
        until(&svc, ServiceState::Running).await.unwrap();
        let first_pid = svc.pid();
        assert_eq!(svc.restart().await.unwrap(), ServiceState::Starting);
        until(&svc, ServiceState::Running).await.unwrap();
        assert_ne!(svc.pid(), first_pid);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_from_error_goes_straight_to_starting() {
        use futures::StreamExt;

        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("crashed-once");
        let script = format!(
            r#"if [ -e '{m}' ]; then echo "Listening on x"; exec sleep 30; fi; touch '{m}'; exit 3"#,
            m = marker.display()
        );
        let bus = EventBus::new();
        let svc = service_on(&dir, &script, ready_on_output(), bus.clone());

        svc.start().await.unwrap();
        assert_eq!(until(&svc, ServiceState::Error).await, Some(ServiceState::Error));

        let transitions = bus.stream().filter_map(|event| async move {
            match event {
                crate::events::Event::StateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            }
        });
        tokio::pin!(transitions);
        assert_eq!(svc.restart().await.unwrap(), ServiceState::Starting);
        assert_eq!(
            transitions.next().await,
            Some((ServiceState::Error, ServiceState::Starting))
        );
        assert_eq!(until(&svc, ServiceState::Running).await, Some(ServiceState::Running));
        assert!(svc.last_error().is_none());
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_requires_running_service() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        let err = svc.enable_tunnel().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn reconcile_notices_vanished_process() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, SERVE, ready_on_output());
        svc.start().await.unwrap();
        until(&svc, ServiceState::Running).await.unwrap();
        assert!(!svc.reconcile());

        // point the record at a pid that no longer exists
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        gone.wait().unwrap();
        let real = svc.slot().pid.replace(gone.id()).unwrap();

        assert!(svc.reconcile());
        assert_eq!(svc.state(), ServiceState::Error);
        assert_eq!(svc.last_error().unwrap().kind, ErrorKind::ProcessCrashed);
        assert!(svc.last_error().unwrap().message.contains("vanished"));

        // the monitor's real exit report replaces the inferred one
        ProcessTable::new().kill_tree(real);
        let mut message = String::new();
        for _ in 0..50 {
            message = svc.last_error().unwrap().message;
            if !message.contains("vanished") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(message.contains("signal"), "{message}");
        assert_eq!(svc.last_error().unwrap().kind, ErrorKind::ProcessCrashed);
        assert_eq!(svc.state(), ServiceState::Error);
    }
}
