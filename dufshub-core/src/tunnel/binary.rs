//! Locating and downloading the tunnel binary.

use crate::error::{Result, ServiceError};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;

/// Ensures the tunnel binary exists locally. Shared by every service so only
/// one download runs at a time.
#[derive(Debug)]
pub struct TunnelInstaller {
    path: PathBuf,
    url: String,
    timeout: Duration,
    lock: Mutex<()>,
}

impl TunnelInstaller {
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a usable binary, downloading it first when missing.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn ensure_present(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        if is_present(&self.path).await {
            return Ok(self.path.clone());
        }
        if self.url.is_empty() {
            return Err(ServiceError::BinaryUnavailable(format!(
                "no download for {}-{}, install cloudflared at {}",
                std::env::consts::OS,
                std::env::consts::ARCH,
                self.path.display()
            )));
        }
        tracing::info!(url = %self.url, "tunnel binary missing, downloading");
        match self.download().await {
            Ok(()) => Ok(self.path.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "tunnel binary download failed");
                Err(ServiceError::BinaryUnavailable(e))
            }
        }
    }

    async fn download(&self) -> std::result::Result<(), String> {
        let tmp = tmp_path(&self.path);
        let outcome = self.fetch_to(&tmp).await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return outcome;
        }
        make_executable(&tmp).await.map_err(|e| e.to_string())?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| format!("install failed: {e}"))
    }

    async fn fetch_to(&self, tmp: &Path) -> std::result::Result<(), String> {
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if is_loopback(&self.url) {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| e.to_string())?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("request failed: {e}"))?;

        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| e.to_string())?;
        let mut head = Vec::with_capacity(4);
        let mut total = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| format!("download interrupted: {e}"))?;
            if head.len() < 4 {
                let need = 4 - head.len();
                head.extend_from_slice(&chunk[..need.min(chunk.len())]);
            }
            total += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        }
        file.sync_all().await.map_err(|e| e.to_string())?;

        if total == 0 {
            return Err("downloaded file is empty".into());
        }
        if !is_native_image(&head) {
            return Err("downloaded file is not an executable for this platform".into());
        }
        tracing::info!(bytes = total, "tunnel binary downloaded");
        Ok(())
    }
}

async fn is_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn is_loopback(url: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == "127.0.0.1" || h == "localhost"))
        .unwrap_or(false)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn is_pe(head: &[u8]) -> bool {
    head.starts_with(b"MZ")
}

fn is_elf(head: &[u8]) -> bool {
    head.starts_with(b"\x7fELF")
}

/// Thin or fat Mach-O.
fn is_mach_o(head: &[u8]) -> bool {
    matches!(
        head,
        [0xfe, 0xed, 0xfa, 0xce | 0xcf] | [0xce | 0xcf, 0xfa, 0xed, 0xfe] | [0xca, 0xfe, 0xba, 0xbe]
    )
}

/// Header in the executable format this host can run.
fn is_native_image(head: &[u8]) -> bool {
    if cfg!(windows) {
        is_pe(head)
    } else if cfg!(any(target_os = "macos", target_os = "ios")) {
        is_mach_o(head)
    } else {
        is_elf(head)
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
