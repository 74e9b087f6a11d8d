//! Settings overrides from `DH_*` environment variables.

use anyhow::Context;
use dufshub_core::{PortPolicy, ServerBinary, Settings};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn settings_from_env() -> anyhow::Result<Settings> {
    let mut settings = match env("DH_DATA_DIR") {
        Some(dir) => Settings::with_data_dir(dir),
        None => Settings::default(),
    };

    if let Some(bin) = env("DH_DUFS_BIN") {
        settings.server = ServerBinary::new(bin);
    }
    if let Some(bin) = env("DH_TUNNEL_BIN") {
        settings.tunnel.binary_path = PathBuf::from(bin);
    }
    if let Some(url) = env("DH_TUNNEL_URL") {
        settings.tunnel.download_url = url;
    }
    if let Some(roots) = env("DH_ALLOWED_ROOTS") {
        settings.allowed_roots = std::env::split_paths(&roots).collect();
    }
    if let Some(path) = env("DH_PORT_POLICY") {
        settings.ports = PortPolicy::load(Path::new(&path))
            .with_context(|| format!("failed to load port policy from {path}"))?;
    }
    if let Some(secs) = env("DH_RECONCILE_SECS") {
        let secs: u64 = secs
            .parse()
            .with_context(|| format!("DH_RECONCILE_SECS must be a number of seconds, got {secs:?}"))?;
        settings.timeouts.reconcile_interval = Duration::from_secs(secs.max(1));
    }
    Ok(settings)
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
