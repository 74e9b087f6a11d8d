use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current on-disk schema version of [`ConfigDocument`].
pub const SCHEMA_VERSION: u32 = 2;

/// Sessions that ended this long ago are restored even after a clean exit.
const RESTORE_AFTER_SECS: i64 = 300;

/// Stable service identifier, assigned at creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub username: String,
    pub secret: Secret,
}

/// Independent capabilities granted to visitors of a served directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Permissions {
    #[serde(default)]
    pub allow_upload: bool,
    #[serde(default)]
    pub allow_delete: bool,
    #[serde(default)]
    pub allow_search: bool,
    #[serde(default)]
    pub allow_archive: bool,
}

impl Permissions {
    /// Convenience for the "allow all" toggle; not persisted as its own flag.
    pub fn all() -> Self {
        Self {
            allow_upload: true,
            allow_delete: true,
            allow_search: true,
            allow_archive: true,
        }
    }

    pub fn is_all(&self) -> bool {
        *self == Self::all()
    }
}

/// Durable definition of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: ServiceId,
    pub name: String,
    pub root_path: PathBuf,
    pub port: u16,
    /// Interface address to bind; `None` lets the server pick its default.
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub auth: Option<Auth>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ServiceConfig {
    pub(crate) fn from_definition(id: ServiceId, definition: ServiceDefinition, port: u16) -> Self {
        Self {
            id,
            name: definition.name,
            root_path: definition.root_path,
            port,
            bind: definition.bind,
            permissions: definition.permissions,
            auth: definition.auth,
            created_at: Some(Utc::now()),
        }
    }
}

/// Input for the add and edit operations; the port is allocated when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub root_path: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub auth: Option<Auth>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_path: root_path.into(),
            port: None,
            bind: None,
            permissions: Permissions::default(),
            auth: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.auth = Some(Auth {
            username: username.into(),
            secret: Secret::new(secret),
        });
        self
    }
}

/// Front-end owned blob (window placement, preferences). Opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState(pub serde_json::Value);

impl Default for AppState {
    fn default() -> Self {
        Self(serde_json::Value::Object(Default::default()))
    }
}

/// What was running when the application last exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub running: Vec<ServiceId>,
    #[serde(default)]
    pub tunneled: Vec<ServiceId>,
    #[serde(default = "default_normal_exit")]
    pub normal_exit: bool,
    #[serde(default)]
    pub last_exit: Option<DateTime<Utc>>,
}

fn default_normal_exit() -> bool {
    true
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            running: Vec::new(),
            tunneled: Vec::new(),
            normal_exit: true,
            last_exit: None,
        }
    }
}

impl SessionState {
    /// Restore after a crash, or when the previous session ended long enough ago.
    pub fn should_restore(&self, now: DateTime<Utc>) -> bool {
        if !self.normal_exit {
            return true;
        }
        match self.last_exit {
            Some(at) => now - at > Duration::seconds(RESTORE_AFTER_SECS),
            None => true,
        }
    }
}

/// The atomic persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub app_state: AppState,
    #[serde(default)]
    pub session: SessionState,
}

fn current_schema() -> u32 {
    SCHEMA_VERSION
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            services: Vec::new(),
            app_state: AppState::default(),
            session: SessionState::default(),
        }
    }
}
