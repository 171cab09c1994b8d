// ABOUTME: Shared CLI helpers: KEY=VALUE parsing, JSON output and table rendering
// ABOUTME: Keeps the per-command modules free of formatting details

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use csbx_sandbox::{FileEntry, Mount, ProcessInfo, Sandbox, SandboxState};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// clap value parser for `KEY=VALUE`
pub fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// clap value parser for `HOST:CONTAINER[:MODE]`; `~` and relative host paths are made absolute
pub fn parse_mount(raw: &str) -> Result<Mount, String> {
    let mut mount: Mount = raw.parse()?;
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let cwd = std::env::current_dir().map_err(|e| format!("cannot resolve '{}': {}", raw, e))?;
    mount.host_path = absolute_host_path(&mount.host_path, home.as_deref(), &cwd);
    Ok(mount)
}

fn absolute_host_path(path: &Path, home: Option<&Path>, cwd: &Path) -> PathBuf {
    let expanded = match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Progress and confirmation lines go to stderr so stdout can be captured
pub fn status(message: impl std::fmt::Display) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

pub fn note(message: impl std::fmt::Display) {
    eprintln!("{}", message.to_string().yellow());
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn colored_state(state: SandboxState) -> ColoredString {
    let label = state.to_string();
    match state {
        SandboxState::Running => label.green(),
        SandboxState::Paused => label.yellow(),
        SandboxState::Creating | SandboxState::Stopping => label.cyan(),
        SandboxState::Stopped => label.red(),
    }
}

pub fn ports_summary(sandbox: &Sandbox) -> String {
    if sandbox.port_map.is_empty() {
        return "-".to_string();
    }
    sandbox
        .port_map
        .iter()
        .map(|p| format!("{}->{}", p.host_port, p.container_port))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn sandbox_table(sandboxes: &[Sandbox]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["ID", "Name", "State", "Template", "Ports", "Created"]);
    for sandbox in sandboxes {
        table.add_row(vec![
            sandbox.short_id().to_string(),
            sandbox.name.clone(),
            colored_state(sandbox.state).to_string(),
            sandbox.template.clone(),
            ports_summary(sandbox),
            sandbox.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    table
}

pub fn file_table(entries: &[FileEntry]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Name", "Type", "Size", "Mode", "Modified"]);
    for entry in entries {
        let kind = if entry.is_symlink {
            "link"
        } else if entry.is_dir {
            "dir"
        } else {
            "file"
        };
        let name = if entry.is_dir {
            entry.name.blue().bold().to_string()
        } else {
            entry.name.clone()
        };
        table.add_row(vec![
            name,
            kind.to_string(),
            format_size(entry.size),
            format!("{:o}", entry.mode),
            entry.modified.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    table
}

pub fn process_table(processes: &[ProcessInfo]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["PID", "User", "State", "Command"]);
    for process in processes {
        table.add_row(vec![
            process.pid.to_string(),
            process.user.clone(),
            process.state.clone(),
            process.command.clone(),
        ]);
    }
    table
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
