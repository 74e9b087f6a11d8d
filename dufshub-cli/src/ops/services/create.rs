//! Add and edit, from flags or interactively.

use super::{print_snapshot, report, resolve, ServiceArgs};
use crate::ops::output::{print_json, OutputFormat};
use crate::ops::ui::{print_header, print_hint, print_success};
use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, MultiSelect, Password};
use dufshub_core::{Auth, Permissions, Secret, ServiceDefinition, ServiceManager};
use std::path::PathBuf;

pub async fn add_service(
    manager: &ServiceManager,
    args: ServiceArgs,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let definition = args.into_definition()?;
    create(manager, definition, output).await
}

pub async fn edit_service(
    manager: &ServiceManager,
    key: &str,
    args: ServiceArgs,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let id = resolve(manager, key)?;
    let current = manager.snapshot(&id).map_err(report)?.config;
    let definition = args.merge_into(&current)?;
    let config = manager
        .edit_service(&id, definition)
        .await
        .map_err(report)?;

    let snapshot = manager.snapshot(&config.id).map_err(report)?;
    match output {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Table => {
            print_success(&format!("Service '{}' updated", config.name));
            print_snapshot(&snapshot);
            println!();
        }
    }
    Ok(())
}

async fn create(
    manager: &ServiceManager,
    definition: ServiceDefinition,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let config = manager.add_service(definition).await.map_err(report)?;
    let snapshot = manager.snapshot(&config.id).map_err(report)?;
    match output {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Service '{}' created on port {}",
                config.name.as_str().green().bold(),
                config.port
            ));
            print_snapshot(&snapshot);
            println!();
            print_hint(&format!("Use 'run {}' to start it", config.name));
        }
    }
    Ok(())
}

/// Guided add with prompts for every field.
pub async fn add_service_interactive(
    manager: &ServiceManager,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let theme = ColorfulTheme::default();
    print_header("🚀 ADD SERVICE");

    print_step(1, "Basics");
    let name: String = Input::with_theme(&theme)
        .with_prompt("Display name")
        .validate_with(|v: &String| -> Result<(), &str> {
            if v.trim().is_empty() {
                Err("Name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    let path: String = Input::with_theme(&theme)
        .with_prompt("Directory to serve")
        .validate_with(|v: &String| -> Result<(), &str> {
            if PathBuf::from(v.trim()).is_dir() {
                Ok(())
            } else {
                Err("Not an existing directory")
            }
        })
        .interact_text()?;

    print_step(2, "Network");
    let suggested = manager
        .allocator()
        .allocate(&manager.list_services().iter().map(|s| s.port).collect())
        .ok();
    let mut port_prompt = Input::<u16>::with_theme(&theme).with_prompt("Port");
    if let Some(port) = suggested {
        port_prompt = port_prompt.default(port);
    }
    let port = port_prompt.interact_text()?;

    print_step(3, "Permissions");
    let labels = ["Upload", "Delete", "Search", "Archive download"];
    let picked = MultiSelect::with_theme(&theme)
        .with_prompt("Allowed operations (space to toggle)")
        .items(&labels)
        .interact()?;
    let permissions = Permissions {
        allow_upload: picked.contains(&0),
        allow_delete: picked.contains(&1),
        allow_search: picked.contains(&2),
        allow_archive: picked.contains(&3),
    };

    print_step(4, "Access control");
    let auth = if Confirm::with_theme(&theme)
        .with_prompt("Require a username and password?")
        .default(false)
        .interact()?
    {
        let username: String = Input::with_theme(&theme)
            .with_prompt("Username")
            .interact_text()?;
        let password = Password::with_theme(&theme)
            .with_prompt("Password")
            .with_confirmation("Repeat password", "Passwords do not match")
            .interact()?;
        Some(Auth {
            username,
            secret: Secret::new(password),
        })
    } else {
        None
    };

    let definition = ServiceDefinition {
        name: name.trim().to_string(),
        root_path: PathBuf::from(path.trim()),
        port: Some(port),
        bind: None,
        permissions,
        auth,
    };
    if !Confirm::with_theme(&theme)
        .with_prompt(format!(
            "Create '{}' serving {} on port {}?",
            definition.name,
            definition.root_path.display(),
            port
        ))
        .default(true)
        .interact()?
    {
        println!("  {} Cancelled.", "✗".red());
        return Ok(());
    }
    create(manager, definition, output).await
}

fn print_step(n: u8, title: &str) {
    println!();
    println!(
        "  {} {}",
        format!("[{}/4]", n).dark_cyan().bold(),
        title.white().bold()
    );
}
