//! Queue inspection commands.

use colored::Colorize;
use std::path::PathBuf;

use super::{format_timestamp, open_engine};
use crate::cli::QueueCommands;
use crate::error::Result;
use crate::model::Operation;

/// Execute queue commands.
pub fn execute(command: &QueueCommands, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    match command {
        QueueCommands::List { limit } => list(*limit, store_path, json),
    }
}

fn list(limit: usize, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let queue = engine.queue_snapshot();
    let shown: Vec<&Operation> = queue.iter().take(limit).collect();

    if json {
        let output = serde_json::json!({
            "operations": shown,
            "count": shown.len(),
            "total": queue.len(),
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if queue.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} ({} pending)", "Queued operations".bold(), queue.len());
    println!();
    for (position, op) in shown.iter().enumerate() {
        println!(
            "{:>3}. {} {} {}",
            position + 1,
            op.kind.to_string().cyan(),
            op.payload.target,
            op.id.dimmed()
        );
        println!("     queued {}", format_timestamp(op.created_at));
        if op.retry_count > 0 {
            println!("     retries: {}", op.retry_count);
        }
        if let Some(next) = op.next_attempt_at {
            println!("     next attempt {}", format_timestamp(next));
        }
        if let Some(error) = &op.last_error {
            println!("     last error: {}", error.red());
        }
    }
    if queue.len() > shown.len() {
        println!();
        println!("... and {} more", queue.len() - shown.len());
    }

    Ok(())
}
