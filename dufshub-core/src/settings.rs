//! Runtime tunables for the supervisor.

use crate::port::PortPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "dufs_config.json";
pub const BACKUP_SUFFIX: &str = "bak";
pub const MAX_LOG_LINES: usize = 2000;
pub const MAX_PATH_DEPTH: usize = 20;

const TUNNEL_RELEASES: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download";

/// Release asset of the standalone tunnel binary for a target. macOS builds
/// ship only as archives, so there is nothing to fetch directly there.
fn tunnel_asset(os: &str, arch: &str) -> Option<&'static str> {
    Some(match (os, arch) {
        ("linux", "x86_64") => "cloudflared-linux-amd64",
        ("linux", "aarch64") => "cloudflared-linux-arm64",
        ("linux", "x86") => "cloudflared-linux-386",
        ("linux", "arm") => "cloudflared-linux-arm",
        ("windows", "x86_64") => "cloudflared-windows-amd64.exe",
        ("windows", "x86") => "cloudflared-windows-386.exe",
        _ => return None,
    })
}

/// Download URL for this host, or empty when no direct build exists.
fn default_tunnel_url() -> String {
    tunnel_asset(std::env::consts::OS, std::env::consts::ARCH)
        .map(|asset| format!("{TUNNEL_RELEASES}/{asset}"))
        .unwrap_or_default()
}

/// How a freshly spawned server is judged ready to accept connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Alive after the grace period counts as ready.
    Grace(Duration),
    /// Ready once a TCP connect to the service port succeeds.
    TcpConnect,
    /// Ready once any output line contains the pattern.
    OutputContains(String),
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::TcpConnect
    }
}

/// Program used to serve a directory. `leading_args` go before the generated ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBinary {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ServerBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ServerBinary {
    fn default() -> Self {
        Self::new(if cfg!(windows) { "dufs.exe" } else { "dufs" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub binary_path: PathBuf,
    /// Passed before the generated arguments, like [`ServerBinary::leading_args`].
    pub leading_args: Vec<String>,
    /// Empty when no build is published for this host.
    pub download_url: String,
    /// Host suffix identifying the public URL in the tunnel's output.
    pub url_suffix: String,
}

impl TunnelSettings {
    pub fn in_dir(dir: &std::path::Path) -> Self {
        let name = if cfg!(windows) { "cloudflared.exe" } else { "cloudflared" };
        Self {
            binary_path: dir.join(name),
            leading_args: Vec::new(),
            download_url: default_tunnel_url(),
            url_suffix: ".trycloudflare.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub readiness: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub download: Duration,
    pub tunnel_url: Duration,
    pub shutdown_grace: Duration,
    pub remove: Duration,
    pub reconcile_interval: Duration,
    pub autosave_debounce: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            download: Duration::from_secs(120),
            tunnel_url: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            remove: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(5),
            autosave_debounce: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub server: ServerBinary,
    pub tunnel: TunnelSettings,
    pub readiness: Readiness,
    pub ports: PortPolicy,
    /// Roots a served path must live under; `*` or empty means anywhere.
    pub allowed_roots: Vec<PathBuf>,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "DufsHub")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            tunnel: TunnelSettings::in_dir(&data_dir),
            data_dir,
            server: ServerBinary::default(),
            readiness: Readiness::default(),
            ports: PortPolicy::default(),
            allowed_roots: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_asset_follows_host_platform() {
        assert_eq!(tunnel_asset("linux", "x86_64"), Some("cloudflared-linux-amd64"));
        assert_eq!(tunnel_asset("linux", "aarch64"), Some("cloudflared-linux-arm64"));
        assert_eq!(tunnel_asset("windows", "x86_64"), Some("cloudflared-windows-amd64.exe"));
        assert_eq!(tunnel_asset("macos", "aarch64"), None);
        assert_eq!(tunnel_asset("freebsd", "x86_64"), None);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn linux_default_downloads_linux_build() {
        let settings = Settings::with_data_dir("/tmp/dufshub");
        assert!(settings.tunnel.download_url.ends_with("/cloudflared-linux-amd64"));
        assert_eq!(settings.tunnel.binary_path, PathBuf::from("/tmp/dufshub/cloudflared"));
    }
}
