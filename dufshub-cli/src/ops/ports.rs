use super::output::{print_json, OutputFormat};
use super::ui::{print_error, print_header, print_kv, print_section, print_success};
use dufshub_core::{is_port_free, ServiceManager};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Serialize)]
struct PortCheck {
    port: u16,
    usable: bool,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct PortReport<'a> {
    min_port: u16,
    max_port: u16,
    default_port: u16,
    reserved_max: u16,
    denied: usize,
    assigned: Vec<u16>,
    next_free: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<&'a PortCheck>,
}

/// Show the port policy, the ports already assigned and the next free one;
/// with `check`, judge a single port the way `add --port` would.
pub fn show_ports(
    manager: &ServiceManager,
    check: Option<u16>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let allocator = manager.allocator();
    let policy = allocator.policy();
    let mut assigned: Vec<u16> = manager.list_services().iter().map(|s| s.port).collect();
    assigned.sort_unstable();
    let taken: HashSet<u16> = assigned.iter().copied().collect();
    let next_free = allocator.allocate(&taken).ok();

    let checked = check.map(|port| {
        let reason = if taken.contains(&port) {
            Some("assigned to another service".to_string())
        } else {
            allocator.validate(port).err().map(|e| e.message())
        };
        PortCheck {
            port,
            usable: reason.is_none(),
            reason,
        }
    });

    if output == OutputFormat::Json {
        return print_json(&PortReport {
            min_port: policy.min_port,
            max_port: policy.max_port,
            default_port: policy.default_port,
            reserved_max: policy.reserved_max,
            denied: policy.deny_list.len(),
            assigned,
            next_free,
            check: checked.as_ref(),
        });
    }

    print_header("🔌 PORTS");
    print_section("Policy");
    print_kv("Range", &format!("{}..={}", policy.min_port, policy.max_port));
    print_kv("Starts at", &policy.default_port.to_string());
    print_kv("Privileged", &format!("<= {}", policy.reserved_max));
    print_kv("Deny-listed", &format!("{} port(s)", policy.deny_list.len()));

    print_section("Assignments");
    if assigned.is_empty() {
        print_kv("Assigned", "none");
    } else {
        let listed: Vec<String> = assigned
            .iter()
            .map(|p| {
                if is_port_free(*p) {
                    p.to_string()
                } else {
                    format!("{p} (bound)")
                }
            })
            .collect();
        print_kv("Assigned", &listed.join(", "));
    }
    print_kv(
        "Next free",
        &next_free.map_or_else(|| "none".to_string(), |p| p.to_string()),
    );

    if let Some(result) = &checked {
        println!();
        match &result.reason {
            None => print_success(&format!("Port {} is usable", result.port)),
            Some(reason) => print_error(&format!("Port {}: {}", result.port, reason)),
        }
    }
    println!();
    Ok(())
}
