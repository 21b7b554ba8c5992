//! Flush command implementation.
//!
//! `tfsync flush` drains the queue against the configured server: runs are
//! repeated while each one fills its per-run budget, and stop as soon as a
//! run ends early (empty queue, backoff, or a recoverable failure at the
//! head). `--watch` instead starts the scheduler and reports status changes
//! until Ctrl-C.

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use super::open_engine_with;
use crate::cli::FlushArgs;
use crate::config::load_config;
use crate::error::{Error, Result};
use crate::sync::{spawn_scheduler, FlushReport, HttpRemoteApi, SyncEngine, SyncPhase};

/// Runs attempted by a single non-watch flush before giving up.
const MAX_RUNS: usize = 1000;

/// Execute the flush command.
pub fn execute(args: &FlushArgs, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let mut config = load_config()?;
    if let Some(server) = &args.server {
        config.server.clone_from(server);
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }

    let engine = open_engine_with(store_path, false, &config)?;
    tracing::info!(server = %config.server, pending = engine.pending_count(), "Flushing");

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))?;

    if args.watch {
        return rt.block_on(watch(Arc::new(engine), json));
    }

    let total = rt.block_on(drain(&engine));
    if json {
        let output = serde_json::json!({
            "server": config.server,
            "report": total,
            "deadLetters": engine.dead_letters().len(),
        });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_report(&total);
    }
    Ok(())
}

/// Repeat flush runs while each one hits the per-run cap.
async fn drain(engine: &SyncEngine<HttpRemoteApi>) -> FlushReport {
    let cap = engine.settings().max_per_run;
    let mut total = FlushReport::default();
    for _ in 0..MAX_RUNS {
        let report = engine.attempt_flush().await;
        total.dispatched += report.dispatched;
        total.succeeded += report.succeeded;
        total.retried += report.retried;
        total.dead_lettered += report.dead_lettered;
        total.remaining = report.remaining;
        total.cancelled = report.cancelled;

        let progressed = report.succeeded + report.dead_lettered;
        if report.remaining == 0 || report.retried > 0 || progressed < cap || report.cancelled {
            break;
        }
    }
    total
}

async fn watch(engine: Arc<SyncEngine<HttpRemoteApi>>, json: bool) -> Result<()> {
    let mut status = engine.subscribe();
    let scheduler = spawn_scheduler(engine.clone());
    scheduler.notify_online();

    if !json {
        println!(
            "Watching (every {}s). Press Ctrl-C to stop.",
            engine.settings().flush_interval.as_secs()
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else if snapshot.phase != SyncPhase::Syncing {
                    println!(
                        "[{}] pending {} | dead-lettered {}",
                        snapshot.phase, snapshot.pending, snapshot.dead_lettered
                    );
                }
            }
        }
    }

    scheduler.shutdown().await;
    engine.shutdown();
    tracing::info!(pending = engine.pending_count(), "Stopped watching");
    Ok(())
}

fn print_report(report: &FlushReport) {
    if report.dispatched == 0 && report.remaining == 0 {
        println!("{}", "Nothing to flush.".green());
        return;
    }

    println!("{}", "Flush complete".bold());
    println!();
    println!("  Sent:          {}", report.dispatched);
    println!("  Confirmed:     {}", report.succeeded.to_string().green());
    if report.retried > 0 {
        println!("  Retrying:      {}", report.retried.to_string().yellow());
    }
    if report.dead_lettered > 0 {
        println!("  Dead-lettered: {}", report.dead_lettered.to_string().red());
    }
    println!("  Remaining:     {}", report.remaining);
    if report.remaining > 0 {
        println!();
        println!(
            "{}",
            "Some operations are still queued; they will be retried on the next flush.".dimmed()
        );
    }
}
