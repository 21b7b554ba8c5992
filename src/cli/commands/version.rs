//! Version command implementation.

use crate::error::Result;
use crate::storage::STORE_SCHEMA_VERSION;
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    /// Envelope version written to the store.
    store_schema: u32,
}

/// Print the crate version, build profile and store schema version.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let output = VersionOutput {
        version: env!("CARGO_PKG_VERSION"),
        build: if cfg!(debug_assertions) { "dev" } else { "release" },
        store_schema: STORE_SCHEMA_VERSION,
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!(
            "tfsync version {} ({}, store schema v{})",
            output.version, output.build, output.store_schema
        );
    }
    Ok(())
}
