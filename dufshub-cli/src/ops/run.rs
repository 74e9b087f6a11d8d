//! Foreground supervision: start services, echo events, shut down on Ctrl+C.

use super::output::OutputFormat;
use super::services::{print_snapshot, resolve};
use super::ui::{format_state, print_error, print_header, print_info, print_success, print_warning};
use crossterm::style::Stylize;
use dufshub_core::{
    BatchItem, BatchReport, Event, FailureRecord, ServiceId, ServiceManager, ServiceState,
    TunnelState,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RunOptions {
    pub services: Vec<String>,
    pub tunnel: bool,
    pub restore: bool,
    pub logs: bool,
}

pub async fn run(
    manager: &ServiceManager,
    options: RunOptions,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let json = output == OutputFormat::Json;
    // subscribe before starting so no transition is missed
    let mut events = manager.events().stream();
    let names: HashMap<ServiceId, String> = manager
        .list_services()
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    if !json {
        print_header("▶️  DUFSHUB");
    }

    let report = if options.restore {
        manager.restore_session().await
    } else if options.services.is_empty() {
        manager.start_all().await
    } else {
        let mut report = BatchReport::default();
        for key in &options.services {
            let id = match resolve(manager, key) {
                Ok(id) => id,
                Err(e) => {
                    let _ = manager.shutdown().await;
                    return Err(e);
                }
            };
            let outcome = manager.start_service(&id).await;
            report.items.push(BatchItem {
                service_id: id,
                name: key.clone(),
                error: outcome
                    .err()
                    .map(|e| FailureRecord::new(e.kind(), e.message())),
            });
        }
        report
    };

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        for item in &report.items {
            match &item.error {
                None => print_info(&format!("{} starting", item.name)),
                Some(err) => print_error(&format!("{}: [{:?}] {}", item.name, err.kind, err.message)),
            }
        }
        if report.items.is_empty() {
            print_warning("Nothing to start");
        }
    }

    let started: Vec<ServiceId> = report
        .items
        .iter()
        .filter(|item| item.error.is_none())
        .map(|item| item.service_id.clone())
        .collect();
    manager.spawn_reconciler(manager.settings().timeouts.reconcile_interval);

    if options.tunnel {
        let manager = manager.clone();
        let settle = manager.settings().timeouts.readiness + Duration::from_secs(1);
        tokio::spawn(async move {
            for id in started {
                let Ok(svc) = manager.service(&id) else {
                    continue;
                };
                let state = svc.wait_for(settle, |s| s != ServiceState::Starting).await;
                if state != Some(ServiceState::Running) {
                    continue;
                }
                if let Err(e) = manager.enable_tunnel(&id).await {
                    tracing::warn!(service_id = %id, error = %e, "could not open tunnel");
                }
            }
        });
    }

    if !json {
        print_info("Press Ctrl+C to stop all services.");
        println!();
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.next() => {
                let Some(event) = event else { break };
                if json {
                    if options.logs || !matches!(event, Event::LogLine { .. }) {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                    continue;
                }
                render(manager, &names, &event, options.logs);
            }
        }
    }

    if !json {
        println!();
        print_info("Stopping services...");
    }
    let report = manager.shutdown().await;
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else if report.is_success() {
        print_success("All services stopped");
    } else {
        for item in report.failures() {
            if let Some(err) = &item.error {
                print_error(&format!("{}: {}", item.name, err.message));
            }
        }
    }
    Ok(())
}

fn render(
    manager: &ServiceManager,
    names: &HashMap<ServiceId, String>,
    event: &Event,
    logs: bool,
) {
    let name_of = |id: &ServiceId| {
        manager
            .service(id)
            .map(|s| s.name())
            .ok()
            .or_else(|| names.get(id).cloned())
            .unwrap_or_else(|| id.to_string())
    };
    match event {
        Event::StateChanged { service_id, to, .. } => {
            let name = name_of(service_id);
            println!("  {} {}", format!("{name:<20}").cyan(), format_state(*to));
            match to {
                ServiceState::Running => {
                    if let Ok(snapshot) = manager.snapshot(service_id) {
                        if let Some(url) = &snapshot.runtime.local_url {
                            println!("  {:<20} {}", "", url.as_str().underlined());
                        }
                    }
                }
                ServiceState::Error => {
                    if let Ok(snapshot) = manager.snapshot(service_id) {
                        print_snapshot(&snapshot);
                    }
                }
                _ => {}
            }
        }
        Event::TunnelChanged {
            service_id,
            to,
            public_url,
            ..
        } => {
            let name = name_of(service_id);
            match (to, public_url) {
                (TunnelState::Active, Some(url)) => {
                    println!("  {} tunnel {}", format!("{name:<20}").cyan(), url.as_str().green().underlined())
                }
                (TunnelState::Error, _) => {
                    let detail = manager
                        .snapshot(service_id)
                        .ok()
                        .and_then(|s| s.runtime.tunnel.last_error)
                        .map(|e| e.message)
                        .unwrap_or_default();
                    println!("  {} tunnel {} {}", format!("{name:<20}").cyan(), "failed".red(), detail)
                }
                (state, _) => println!("  {} tunnel {}", format!("{name:<20}").cyan(), state),
            }
        }
        Event::LogLine { service_id, line } if logs => {
            println!(
                "  {} {}",
                format!("[{}]", name_of(service_id)).dark_grey(),
                line.text
            );
        }
        Event::Notice { kind, message, .. } => print_warning(&format!("[{kind:?}] {message}")),
        _ => {}
    }
}
