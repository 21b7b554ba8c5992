//! Status command implementation.

use serde::Serialize;
use std::path::PathBuf;

use super::{now_ms, open_engine};
use crate::error::Result;
use crate::sync::{print_status, summarize, QueueSummary};

#[derive(Serialize)]
struct StatusOutput {
    store: Option<String>,
    #[serde(flatten)]
    summary: QueueSummary,
}

/// Execute the status command.
pub fn execute(store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let summary = summarize(
        &engine.queue_snapshot(),
        &engine.dead_letters(),
        engine.mapped_id_count(),
    );

    if json {
        let output = StatusOutput {
            store: crate::config::resolve_store_path(store_path.map(PathBuf::as_path))
                .map(|p| p.display().to_string()),
            summary,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_status(&summary, now_ms());
    }

    Ok(())
}
