//! tfsync CLI entry point.

use clap::Parser;
use std::process::ExitCode;
use tfsync::cli::commands;
use tfsync::cli::{Cli, Commands};
use tfsync::error::Error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    init_tracing(cli.verbose, cli.quiet);

    // --json, or stdout is not a terminal
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info,reqwest=info,hyper=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let store = cli.store.as_ref();
    match &cli.command {
        Commands::Version => commands::version::execute(json),
        Commands::Completions { shell } => commands::completions::execute(shell),

        Commands::Status => commands::status::execute(store, json),
        Commands::Queue { command } => commands::queue::execute(command, store, json),
        Commands::DeadLetter { command } => commands::dead_letter::execute(command, store, json),
        Commands::Flush(args) => commands::flush::execute(args, store, json),

        // Offline mutations
        Commands::Task { command } => commands::entity::execute_task(command, store, json),
        Commands::Project { command } => commands::entity::execute_project(command, store, json),
        Commands::Member { command } => commands::entity::execute_member(command, store, json),
        Commands::Comment { command } => commands::entity::execute_comment(command, store, json),
    }
}
