//! Output formatting utilities

use console::style;
use segdl_types::{TransferSnapshot, TransferState};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format a duration in seconds as human-readable
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn print_transfer_summary(snapshot: &TransferSnapshot) {
    let marker = match snapshot.state {
        TransferState::Completed => style("✓").green().bold(),
        TransferState::Failed => style("✗").red().bold(),
        _ => style("…").yellow().bold(),
    };
    println!("{} {}", marker, style(&snapshot.resource.name).cyan());
    println!("  Path: {}", snapshot.destination.display());
    println!(
        "  Transferred: {} / {} ({:.1}%)",
        format_bytes(snapshot.bytes_transferred),
        format_bytes(snapshot.total_size),
        snapshot.progress()
    );
    if let (Some(start), Some(finish)) = (snapshot.started_at, snapshot.finished_at) {
        println!("  Took: {}", format_elapsed((finish - start).num_seconds()));
    }
    if let Some(error) = &snapshot.error {
        println!("  Error: {}", style(error).red());
    }
}
