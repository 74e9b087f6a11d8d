use super::*;
use crate::settings::MAX_PATH_DEPTH;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

impl ServiceManager {
    /// Trimmed name, unique among services other than `except`.
    pub(super) fn check_name(&self, name: &str, except: Option<&ServiceId>) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidState("service name must not be empty".into()));
        }
        let taken = self
            .services()
            .iter()
            .any(|s| Some(s.id()) != except && s.name() == name);
        if taken {
            return Err(ServiceError::DuplicateName(name.to_string()));
        }
        Ok(name.to_string())
    }

    /// Canonical form of `root`, after checking it is an existing directory
    /// inside the allowed roots and not absurdly deep.
    pub(super) fn check_root(&self, root: &Path) -> Result<PathBuf> {
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        let canonical = absolute
            .canonicalize()
            .map_err(|_| ServiceError::InvalidPath(format!("{} does not exist", absolute.display())))?;
        if !canonical.is_dir() {
            return Err(ServiceError::InvalidPath(format!(
                "{} is not a directory",
                absolute.display()
            )));
        }

        let depth = canonical
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();
        if depth > MAX_PATH_DEPTH {
            return Err(ServiceError::InvalidPath(format!(
                "{} is nested deeper than {MAX_PATH_DEPTH} levels",
                absolute.display()
            )));
        }

        // "*" or nothing configured means anywhere
        let roots = &self.settings.allowed_roots;
        if roots.is_empty() || roots.iter().any(|p| p.as_os_str() == "*") {
            return Ok(plain(canonical));
        }
        let inside = roots.iter().any(|allowed| {
            allowed
                .canonicalize()
                .map(|allowed| canonical.starts_with(allowed))
                .unwrap_or(false)
        });
        if !inside {
            return Err(ServiceError::InvalidPath(format!(
                "{} is outside the allowed roots",
                canonical.display()
            )));
        }
        Ok(plain(canonical))
    }

    /// Ports configured for every service other than `except`.
    fn taken_ports(&self, except: Option<&ServiceId>) -> HashSet<u16> {
        self.services()
            .iter()
            .filter(|s| Some(s.id()) != except)
            .map(|s| s.port())
            .collect()
    }

    /// Validate an explicit port or allocate one.
    ///
    /// Configured ports are unique across the collection whether or not their
    /// services run, so a port held by a stopped service is still refused.
    pub(super) fn resolve_port(&self, requested: Option<u16>, except: Option<&ServiceId>) -> Result<u16> {
        let taken = self.taken_ports(except);
        match requested {
            Some(port) => {
                if let Some(owner) = self
                    .services()
                    .iter()
                    .find(|s| Some(s.id()) != except && s.port() == port)
                {
                    return Err(ServiceError::PortUnavailable {
                        port,
                        reason: format!("assigned to service '{}'", owner.name()),
                    });
                }
                self.allocator.validate(port)?;
                Ok(port)
            }
            None => self.allocator.allocate(&taken),
        }
    }
}

/// Make names, ids and ports unique in a loaded document. Returns how many
/// entries were changed.
///
/// Later duplicates are renamed `name_1`, `name_2`, ... and moved to a fresh
/// port; the first occurrence keeps its values.
pub(super) fn repair_document(doc: &mut ConfigDocument, allocator: &PortAllocator) -> usize {
    let originals: HashSet<String> = doc.services.iter().map(|c| c.name.clone()).collect();
    // every configured port stays off-limits to the reallocated duplicates
    let mut reserved: HashSet<u16> = doc.services.iter().map(|c| c.port).collect();
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut ports = HashSet::new();
    let mut repairs = 0;

    for config in doc.services.iter_mut() {
        let mut changed = false;

        if !ids.insert(config.id.clone()) {
            config.id = ServiceId::generate();
            ids.insert(config.id.clone());
            changed = true;
        }

        if !names.insert(config.name.clone()) {
            config.name = unique_name(&config.name, &names, &originals);
            names.insert(config.name.clone());
            changed = true;
        }

        if !ports.insert(config.port) {
            match allocator.allocate(&reserved) {
                Ok(port) => {
                    reserved.insert(port);
                    ports.insert(port);
                    config.port = port;
                    changed = true;
                }
                Err(e) => {
                    tracing::warn!(name = %config.name, error = %e, "no port left to repair duplicate");
                }
            }
        }

        if changed {
            tracing::warn!(
                service_id = %config.id,
                name = %config.name,
                port = config.port,
                "repaired service entry"
            );
            repairs += 1;
        }
    }
    repairs
}

fn unique_name(base: &str, assigned: &HashSet<String>, originals: &HashSet<String>) -> String {
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if !assigned.contains(&candidate) && !originals.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Drop the `\\?\` prefix Windows adds to canonical drive paths.
#[cfg(windows)]
fn plain(path: PathBuf) -> PathBuf {
    let stripped = path
        .to_str()
        .and_then(|s| s.strip_prefix(r"\\?\"))
        .filter(|rest| !rest.starts_with("UNC\\"))
        .map(PathBuf::from);
    stripped.unwrap_or(path)
}

#[cfg(not(windows))]
fn plain(path: PathBuf) -> PathBuf {
    path
}
