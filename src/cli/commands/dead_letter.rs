//! Dead-letter commands.

use colored::Colorize;
use std::path::PathBuf;

use super::{format_timestamp, open_engine};
use crate::cli::DeadLetterCommands;
use crate::error::Result;

/// Execute dead-letter commands.
pub fn execute(
    command: &DeadLetterCommands,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    match command {
        DeadLetterCommands::List => list(store_path, json),
        DeadLetterCommands::Requeue { id } => requeue(id, store_path, json),
        DeadLetterCommands::Clear { force } => clear(*force, store_path, json),
    }
}

fn list(store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let records = engine.dead_letters();

    if json {
        let output = serde_json::json!({
            "records": records,
            "count": records.len(),
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No dead-lettered operations.");
        return Ok(());
    }

    println!("{} ({})", "Dead-lettered operations".red().bold(), records.len());
    println!();
    for record in &records {
        let op = &record.operation;
        println!(
            "{} {} {}",
            op.kind.to_string().cyan(),
            op.payload.target,
            op.id.dimmed()
        );
        println!("  reason:  {}", record.reason);
        println!("  error:   {}", record.error.red());
        println!("  retries: {}", record.retry_count);
        println!("  at:      {}", format_timestamp(record.timestamp));
    }
    println!();
    println!(
        "{}",
        "Requeue with: tfsync dead-letter requeue <operation-id>".dimmed()
    );

    Ok(())
}

fn requeue(id: &str, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let op = engine.requeue_dead_letter(id)?;

    if json {
        let output = serde_json::json!({
            "requeued": op,
            "pending": engine.pending_count(),
        });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Requeued {} {} ({})", op.kind, op.payload.target, op.id);
        println!("  Pending: {}", engine.pending_count());
    }

    Ok(())
}

fn clear(force: bool, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let count = engine.dead_letters().len();

    if !force && count > 0 && !json {
        println!("Warning: This will permanently drop {count} dead-lettered operations.");
        println!();
        println!("Use --force to confirm.");
        return Ok(());
    }

    let cleared = engine.clear_dead_letters()?;
    if json {
        println!("{}", serde_json::json!({ "cleared": cleared }));
    } else {
        println!("Cleared {cleared} dead-lettered operations.");
    }

    Ok(())
}
