//! Queue status display.
//!
//! Summarizes the persisted queue and dead-letter store for the CLI's
//! `status` command.

use std::collections::BTreeMap;

use colored::Colorize;
use serde::Serialize;

use super::dead_letter::DeadLetterRecord;
use crate::model::Operation;

/// Snapshot of what is waiting to sync.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    /// Queued operations.
    pub pending: usize,
    /// Queued operations per kind (`create_task`, ...).
    pub by_kind: BTreeMap<String, usize>,
    /// Operations that have failed at least once and are waiting to retry.
    pub retrying: usize,
    /// Enqueue time of the oldest queued operation (Unix milliseconds).
    pub oldest_created_at: Option<i64>,
    /// Last error recorded on the queue head.
    pub head_error: Option<String>,
    pub dead_lettered: usize,
    /// Temporary ids with a known canonical id.
    pub mapped_ids: usize,
}

/// Build a summary from a queue snapshot and the dead-letter list.
#[must_use]
pub fn summarize(queue: &[Operation], dead: &[DeadLetterRecord], mapped_ids: usize) -> QueueSummary {
    let mut by_kind = BTreeMap::new();
    for op in queue {
        *by_kind.entry(op.kind.to_string()).or_insert(0) += 1;
    }
    QueueSummary {
        pending: queue.len(),
        by_kind,
        retrying: queue.iter().filter(|op| op.retry_count > 0).count(),
        oldest_created_at: queue.iter().map(|op| op.created_at).min(),
        head_error: queue.first().and_then(|op| op.last_error.clone()),
        dead_lettered: dead.len(),
        mapped_ids,
    }
}

/// Print a summary to stdout in a human-readable format.
pub fn print_status(summary: &QueueSummary, now_ms: i64) {
    println!("{}", "Sync Status".bold().underline());
    println!();

    if summary.pending == 0 {
        println!("{}", "Queue is empty; everything is synced.".green());
    } else {
        println!("{}", "Pending Operations:".yellow().bold());
        for (kind, count) in &summary.by_kind {
            println!("  {kind:<16} {count}");
        }
        println!("  {}: {}", "Total".bold(), summary.pending);
        if let Some(oldest) = summary.oldest_created_at {
            println!("  Oldest:          {} ago", format_age(now_ms - oldest));
        }
        if summary.retrying > 0 {
            println!("  Retrying:        {}", summary.retrying);
        }
        if let Some(error) = &summary.head_error {
            println!("  Last error:      {}", error.red());
        }
        println!();
        println!("{}", "Run 'tfsync flush' to send pending changes.".dimmed());
    }

    println!();
    if summary.dead_lettered > 0 {
        println!(
            "{} {}",
            "Dead-lettered:".red().bold(),
            summary.dead_lettered
        );
        println!(
            "{}",
            "Run 'tfsync dead-letter list' to inspect them.".dimmed()
        );
    } else {
        println!("{}", "No dead-lettered operations.".dimmed());
    }
}

/// Format a duration in milliseconds as a short human-readable age.
#[must_use]
pub fn format_age(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}
