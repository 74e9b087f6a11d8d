//! Terminal styling helpers.

use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use dufshub_core::{ServiceState, TunnelState};

/// Display width, counting non-ASCII (CJK, emoji) as two cells.
fn display_width(s: &str) -> usize {
    s.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum()
}

/// Boxed section header.
pub fn print_header(title: &str) {
    let inner_width: usize = 58;
    let total_padding = inner_width.saturating_sub(display_width(title));
    let left_pad = total_padding / 2;
    let right_pad = total_padding - left_pad;

    println!();
    println!("{}", format!("╔{}╗", "═".repeat(inner_width)).dark_cyan());
    println!(
        "{}",
        format!("║{}{}{}║", " ".repeat(left_pad), title, " ".repeat(right_pad)).dark_cyan()
    );
    println!("{}", format!("╚{}╝", "═".repeat(inner_width)).dark_cyan());
    println!();
}

pub fn print_section(title: &str) {
    println!();
    println!("  {} {}", "▸".dark_cyan(), title.white().bold());
    println!("  {}", "─".repeat(50).dark_grey());
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}

pub fn print_info(msg: &str) {
    println!("  {} {}", "ℹ".blue(), msg);
}

pub fn print_kv(key: &str, value: &str) {
    println!("  {:<14} {}", format!("{}:", key).dark_grey(), value);
}

pub fn print_hint(msg: &str) {
    println!("  {} {}", "💡".yellow(), msg.dark_grey());
}

pub fn print_empty(msg: &str) {
    println!();
    println!("  {}", msg.dark_grey().italic());
    println!();
}

pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  {}", header.white().bold());
    let separator: String = columns
        .iter()
        .map(|(_, width)| "─".repeat(*width))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  {}", separator.dark_grey());
}

/// Truncate on character boundaries so CJK names never split.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max.saturating_sub(3)).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Uncoloured label; pad it before styling so columns line up.
pub fn state_label(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Running => "● Running",
        ServiceState::Starting => "◐ Starting",
        ServiceState::Stopping => "◑ Stopping",
        ServiceState::Stopped => "○ Stopped",
        ServiceState::Error => "✗ Error",
    }
}

pub fn format_state(state: ServiceState) -> String {
    let label = state_label(state);
    match state {
        ServiceState::Running => label.green().to_string(),
        ServiceState::Starting | ServiceState::Stopping => label.yellow().to_string(),
        ServiceState::Stopped => label.dark_grey().to_string(),
        ServiceState::Error => label.red().to_string(),
    }
}

pub fn format_tunnel(state: TunnelState) -> String {
    match state {
        TunnelState::Active => "active".green().to_string(),
        TunnelState::Connecting => "connecting".yellow().to_string(),
        TunnelState::Inactive => "-".dark_grey().to_string(),
        TunnelState::Error => "error".red().to_string(),
    }
}

pub fn format_uptime(since: DateTime<Utc>) -> String {
    let seconds = (Utc::now() - since).num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h {}m", days, hours % 24, minutes % 60)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}
