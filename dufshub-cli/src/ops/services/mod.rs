//! Service collection commands.

mod create;

use super::output::{print_json, OutputFormat};
use super::ui::{
    format_state, format_tunnel, format_uptime, print_empty, print_error, print_header,
    print_hint, print_kv, print_section, print_success, print_table_header, state_label,
    truncate,
};
use clap::Args;
use crossterm::style::Stylize;
use dufshub_core::{
    Auth, Permissions, Secret, ServiceConfig, ServiceDefinition, ServiceError, ServiceId,
    ServiceManager, ServiceSnapshot, ServiceState,
};
use std::path::PathBuf;

pub use create::{add_service, add_service_interactive, edit_service};

/// Fields shared by `add` and `edit`. On edit, omitted fields keep their value.
#[derive(Args, Debug, Default, Clone)]
pub struct ServiceArgs {
    /// Display name
    pub name: Option<String>,
    /// Directory to serve
    pub path: Option<PathBuf>,
    /// Port to listen on; allocated when omitted
    #[arg(long)]
    pub port: Option<u16>,
    /// Interface address to bind
    #[arg(long)]
    pub bind: Option<String>,
    #[arg(long)]
    pub allow_upload: bool,
    #[arg(long)]
    pub allow_delete: bool,
    #[arg(long)]
    pub allow_search: bool,
    #[arg(long)]
    pub allow_archive: bool,
    /// Grant every permission
    #[arg(long)]
    pub allow_all: bool,
    /// Require credentials
    #[arg(long, value_name = "USER:PASSWORD")]
    pub auth: Option<String>,
    /// Drop existing credentials (edit only)
    #[arg(long, conflicts_with = "auth")]
    pub no_auth: bool,
}

impl ServiceArgs {
    /// `None` when no permission flag was given.
    fn permissions(&self) -> Option<Permissions> {
        if self.allow_all {
            return Some(Permissions::all());
        }
        let permissions = Permissions {
            allow_upload: self.allow_upload,
            allow_delete: self.allow_delete,
            allow_search: self.allow_search,
            allow_archive: self.allow_archive,
        };
        (permissions != Permissions::default()).then_some(permissions)
    }

    fn parsed_auth(&self) -> anyhow::Result<Option<Auth>> {
        self.auth.as_deref().map(parse_auth).transpose()
    }

    fn into_definition(self) -> anyhow::Result<ServiceDefinition> {
        let auth = self.parsed_auth()?;
        let permissions = self.permissions().unwrap_or_default();
        let (Some(name), Some(path)) = (self.name, self.path) else {
            anyhow::bail!("a name and a directory are required (or use --interactive)");
        };
        Ok(ServiceDefinition {
            name,
            root_path: path,
            port: self.port,
            bind: self.bind,
            permissions,
            auth,
        })
    }

    fn merge_into(self, current: &ServiceConfig) -> anyhow::Result<ServiceDefinition> {
        let auth = if self.no_auth {
            None
        } else {
            self.parsed_auth()?.or_else(|| current.auth.clone())
        };
        let permissions = self.permissions().unwrap_or(current.permissions);
        Ok(ServiceDefinition {
            name: self.name.unwrap_or_else(|| current.name.clone()),
            root_path: self.path.unwrap_or_else(|| current.root_path.clone()),
            port: self.port,
            bind: self.bind.or_else(|| current.bind.clone()),
            permissions,
            auth,
        })
    }
}

fn parse_auth(raw: &str) -> anyhow::Result<Auth> {
    match raw.split_once(':') {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => Ok(Auth {
            username: user.to_string(),
            secret: Secret::new(pass),
        }),
        _ => anyhow::bail!("--auth expects USER:PASSWORD"),
    }
}

/// Find a service by exact id or name.
pub(crate) fn resolve(manager: &ServiceManager, key: &str) -> anyhow::Result<ServiceId> {
    manager
        .list_services()
        .into_iter()
        .find(|s| s.id.as_str() == key || s.name == key)
        .map(|s| s.id)
        .ok_or_else(|| anyhow::anyhow!("no service with id or name '{key}'"))
}

/// Print a core failure with its kind, then hand it back as an anyhow error.
pub(crate) fn report(err: ServiceError) -> anyhow::Error {
    print_error(&format!("[{:?}] {}", err.kind(), err.message()));
    err.into()
}

pub fn list_services(manager: &ServiceManager, output: OutputFormat) -> anyhow::Result<()> {
    let services = manager.snapshots();
    if output == OutputFormat::Json {
        return print_json(&services);
    }

    print_header("📋 SERVICES");
    if services.is_empty() {
        print_empty("No services configured. Use 'add' to create one.");
        return Ok(());
    }

    let running = services
        .iter()
        .filter(|s| s.runtime.state == ServiceState::Running)
        .count();
    println!(
        "  Total: {}  |  {} Running  |  {} Other",
        services.len().to_string().white().bold(),
        running.to_string().green(),
        (services.len() - running).to_string().dark_grey()
    );
    println!();

    print_table_header(&[("NAME", 20), ("PORT", 6), ("STATUS", 12), ("PATH", 32), ("TUNNEL", 10)]);
    for svc in &services {
        let state = svc.runtime.state;
        let pad = 12usize.saturating_sub(state_label(state).chars().count());
        let path = truncate(&svc.config.root_path.display().to_string(), 32);
        println!(
            "  {:<20} {:<6} {}{} {} {}",
            truncate(&svc.config.name, 20),
            svc.config.port,
            format_state(state),
            " ".repeat(pad),
            format!("{path:<32}").dark_grey(),
            format_tunnel(svc.runtime.tunnel.state)
        );
    }
    println!();
    print_hint("Use 'run' to start services, 'edit <name>' to change one");
    Ok(())
}

pub(crate) fn print_snapshot(snapshot: &ServiceSnapshot) {
    let config = &snapshot.config;
    let runtime = &snapshot.runtime;

    print_section("Configuration");
    print_kv("Name", &config.name);
    print_kv("Id", config.id.as_str());
    print_kv("Directory", &config.root_path.display().to_string());
    print_kv("Port", &config.port.to_string());
    if let Some(bind) = &config.bind {
        print_kv("Bind", bind);
    }
    let p = config.permissions;
    let granted: Vec<&str> = [
        (p.allow_upload, "upload"),
        (p.allow_delete, "delete"),
        (p.allow_search, "search"),
        (p.allow_archive, "archive"),
    ]
    .into_iter()
    .filter_map(|(on, label)| on.then_some(label))
    .collect();
    print_kv(
        "Permissions",
        &if granted.is_empty() {
            "read-only".to_string()
        } else {
            granted.join(", ")
        },
    );
    if let Some(auth) = &config.auth {
        print_kv("Auth", &format!("{} / ****", auth.username));
    }

    print_section("Runtime");
    print_kv("State", &format_state(runtime.state));
    if let Some(pid) = runtime.pid {
        print_kv("PID", &pid.to_string());
    }
    if let Some(url) = &runtime.local_url {
        print_kv("Local URL", url);
    }
    if let Some(since) = runtime.started_at {
        print_kv("Uptime", &format_uptime(since));
    }
    if let Some(url) = &runtime.tunnel.public_url {
        print_kv("Public URL", url);
    }
    if let Some(err) = &runtime.last_error {
        print_kv("Last error", &format!("[{:?}] {}", err.kind, err.message));
    }
}

pub async fn remove_service(manager: &ServiceManager, key: &str) -> anyhow::Result<()> {
    let id = resolve(manager, key)?;
    manager.remove_service(&id).await.map_err(report)?;
    print_success(&format!("Service '{key}' removed"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_needs_both_halves() {
        let auth = parse_auth("admin:p:w").unwrap();
        assert_eq!(auth.username, "admin");
        assert_eq!(auth.secret.expose(), "p:w");
        assert!(parse_auth("admin").is_err());
        assert!(parse_auth(":pw").is_err());
        assert!(parse_auth("admin:").is_err());
    }

    #[test]
    fn edit_keeps_unspecified_fields() {
        let current = ServiceConfig {
            id: ServiceId::from("a"),
            name: "docs".into(),
            root_path: "/srv/docs".into(),
            port: 5001,
            bind: Some("0.0.0.0".into()),
            permissions: Permissions::all(),
            auth: Some(parse_auth("admin:pw").unwrap()),
            created_at: None,
        };
        let args = ServiceArgs {
            name: Some("renamed".into()),
            ..Default::default()
        };
        let def = args.merge_into(&current).unwrap();
        assert_eq!(def.name, "renamed");
        assert_eq!(def.root_path, current.root_path);
        assert_eq!(def.port, None);
        assert_eq!(def.permissions, Permissions::all());
        assert_eq!(def.auth, current.auth);

        let args = ServiceArgs {
            no_auth: true,
            allow_upload: true,
            ..Default::default()
        };
        let def = args.merge_into(&current).unwrap();
        assert!(def.auth.is_none());
        assert!(def.permissions.allow_upload && !def.permissions.allow_delete);
    }

    #[test]
    fn add_requires_name_and_path() {
        assert!(ServiceArgs::default().into_definition().is_err());
        let def = ServiceArgs {
            name: Some("docs".into()),
            path: Some("/srv/docs".into()),
            allow_all: true,
            ..Default::default()
        }
        .into_definition()
        .unwrap();
        assert!(def.permissions.is_all());
    }
}
