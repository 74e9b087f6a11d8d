mod config;
mod ops;

use clap::{Parser, Subcommand};
use dufshub_core::ServiceManager;
use ops::{
    add_service, add_service_interactive, edit_service, list_services, remove_service, run,
    show_ports, OutputFormat, RunOptions, ServiceArgs,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Headless front-end for the dufs service supervisor.
#[derive(Parser)]
#[command(
    name = "dufshub",
    author,
    version,
    about = "Manage and run local dufs file servers"
)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured services
    List,
    /// Add a service
    Add {
        #[command(flatten)]
        service: ServiceArgs,
        /// Prompt for every field
        #[arg(long, short)]
        interactive: bool,
    },
    /// Edit a stopped service (by id or name)
    Edit {
        service_ref: String,
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// Remove a service (by id or name), stopping it first
    Remove { service_ref: String },
    /// Show the port policy, or check one port
    Ports {
        #[arg(long)]
        check: Option<u16>,
    },
    /// Start services and supervise them until Ctrl+C
    Run {
        /// Services to start (id or name); all when empty
        services: Vec<String>,
        /// Open a public tunnel for each started service
        #[arg(long)]
        tunnel: bool,
        /// Restore the previous session instead of starting everything
        #[arg(long)]
        restore: bool,
        /// Echo captured server output
        #[arg(long)]
        logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let settings = config::settings_from_env()?;
    let manager = ServiceManager::open(settings).await?;

    let result = match cli.command {
        Commands::List => list_services(&manager, cli.output),
        Commands::Add {
            service,
            interactive,
        } => {
            if interactive {
                add_service_interactive(&manager, cli.output).await
            } else {
                add_service(&manager, service, cli.output).await
            }
        }
        Commands::Edit {
            service_ref,
            service,
        } => edit_service(&manager, &service_ref, service, cli.output).await,
        Commands::Remove { service_ref } => remove_service(&manager, &service_ref).await,
        Commands::Ports { check } => show_ports(&manager, check, cli.output),
        Commands::Run {
            services,
            tunnel,
            restore,
            logs,
        } => {
            let options = RunOptions {
                services,
                tunnel,
                restore,
                logs,
            };
            // run ends the session itself
            return run(&manager, options, cli.output).await;
        }
    };

    if let Err(e) = manager.close().await {
        tracing::warn!(error = %e, "failed to save configuration");
    }
    result
}

fn init_tracing() {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("DH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses() {
        let _ = Cli::parse_from(["dufshub", "list"]);
        let cli = Cli::parse_from([
            "dufshub", "add", "docs", "/srv/docs", "--port", "5001", "--allow-all",
        ]);
        match cli.command {
            Commands::Add { service, .. } => {
                assert_eq!(service.name.as_deref(), Some("docs"));
                assert_eq!(service.port, Some(5001));
                assert!(service.allow_all);
            }
            _ => panic!("expected add"),
        }
        let cli = Cli::parse_from(["dufshub", "run", "docs", "--tunnel"]);
        assert!(matches!(cli.command, Commands::Run { tunnel: true, .. }));
    }
}
