//! Stats snapshot generation.
//!
//! This module serializes the snapshot to JSON, replaces the output file
//! in one step, and renders the console summary.

use crate::models::{metric, StatsSnapshot};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

/// Generate the JSON snapshot.
pub fn generate_json_snapshot(snapshot: &StatsSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).map_err(Into::into)
}

/// Write the snapshot, replacing any previous file.
///
/// The content goes to a temporary file in the destination directory which
/// is then renamed over the target, so readers see either the old or the new
/// snapshot and never a partial one.
pub fn write_snapshot(snapshot: &StatsSnapshot, path: &Path) -> Result<()> {
    let content = generate_json_snapshot(snapshot)?;

    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    file.write_all(content.as_bytes())?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;

    file.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;

    Ok(())
}

/// Console lines for a finished run.
pub fn summary_lines(snapshot: &StatsSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push("📊 Stats Summary:".to_string());
    for (name, value) in &snapshot.display {
        let marker = if snapshot.is_degraded(name) { " ⚠️" } else { "" };
        lines.push(format!("   {}: {}{}", name, value, marker));
    }

    if snapshot.top_protocols.is_empty() {
        let note = if snapshot.is_degraded(metric::TOP_PROTOCOLS) {
            "unavailable"
        } else {
            "none in window"
        };
        lines.push(format!("   topProtocols: {}", note));
    } else {
        lines.push(format!(
            "   topProtocols: {}",
            snapshot.top_protocols.join(", ")
        ));
    }

    if !snapshot.degraded.is_empty() {
        lines.push(format!(
            "   ⚠️  Degraded (read failed): {}",
            snapshot.degraded.join(", ")
        ));
    }

    lines
}

pub fn print_summary(snapshot: &StatsSnapshot) {
    println!();
    for line in summary_lines(snapshot) {
        println!("{}", line);
    }
}
