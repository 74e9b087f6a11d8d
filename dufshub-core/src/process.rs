//! OS process inspection and termination shared by services and tunnels.

use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, Signal, System};

/// Shared handle to the sysinfo process table.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    system: Arc<Mutex<System>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Whether `pid` still exists. Zombies count as gone.
    pub fn is_alive(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from(pid as usize);
        if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            return false;
        }
        sys.process(pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    /// Ask the process to exit. Returns false when no graceful signal could be
    /// delivered, in which case the caller should escalate straight away.
    pub fn terminate(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from(pid as usize);
        if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            return true;
        }
        match sys.process(pid) {
            Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
            None => true,
        }
    }

    /// Force-kill `pid` and all of its descendants.
    pub fn kill_tree(&self, pid: u32) -> bool {
        if kill_tree_native(pid) {
            return true;
        }
        self.kill_tree_fallback(pid)
    }

    fn kill_tree_fallback(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        sys.refresh_processes();

        let mut tree = Vec::new();
        collect_tree(&sys, Pid::from(pid as usize), &mut tree);
        if tree.is_empty() {
            return true;
        }

        // leaves first so nothing gets reparented mid-sweep
        tree.reverse();
        let mut all_killed = true;
        for member in tree {
            if let Some(process) = sys.process(member) {
                if !process.kill() {
                    all_killed = false;
                }
            }
        }
        all_killed
    }
}

#[cfg(windows)]
fn kill_tree_native(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn kill_tree_native(_pid: u32) -> bool {
    false
}

fn collect_tree(sys: &System, pid: Pid, out: &mut Vec<Pid>) {
    if sys.process(pid).is_some() {
        out.push(pid);
    }
    for (child, process) in sys.processes() {
        if process.parent() == Some(pid) && !out.contains(child) {
            collect_tree(sys, *child, out);
        }
    }
}

/// Human-readable form of a wait result.
pub fn describe_exit(status: &std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    }
}

/// Decode one output line: UTF-8, then GB18030, then lossy. Trailing newlines are stripped.
pub fn decode_line(raw: &[u8]) -> String {
    let mut s = match std::str::from_utf8(raw) {
        Ok(v) => v.to_string(),
        Err(_) => {
            let (cow, _, had_errors) = encoding_rs::GB18030.decode(raw);
            if had_errors {
                String::from_utf8_lossy(raw).into_owned()
            } else {
                cow.into_owned()
            }
        }
    };
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gb18030_output() {
        // "启动" in GB18030
        let raw = [0xc6, 0xf4, 0xb6, 0xaf, b'\r', b'\n'];
        assert_eq!(decode_line(&raw), "启动");
        assert_eq!(decode_line(b"listening\n"), "listening");
    }

    #[test]
    fn missing_pid_is_not_alive() {
        let table = ProcessTable::new();
        assert!(!table.is_alive(u32::MAX - 7));
        assert!(table.kill_tree(u32::MAX - 7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_tree_takes_down_children() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30; wait"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let table = ProcessTable::new();
        assert!(table.is_alive(pid));
        table.kill_tree(pid);
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!table.is_alive(pid));
    }
}
