//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// tfsync - offline-first sync queue for Taskflow
#[derive(Parser, Debug)]
#[command(name = "tfsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Store path (default: ~/.tfsync/data/tfsync.db; a directory selects the file backend)
    #[arg(long, global = true, env = "TFSYNC_STORE")]
    pub store: Option<PathBuf>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print version information
    Version,

    /// Show queue and dead-letter status
    Status,

    /// Inspect the pending operation queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect, requeue or clear dead-lettered operations
    #[command(name = "dead-letter")]
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },

    /// Send pending operations to the server
    Flush(FlushArgs),

    /// Queue task mutations
    Task {
        #[command(subcommand)]
        command: EntityCommands,
    },

    /// Queue project mutations
    Project {
        #[command(subcommand)]
        command: EntityCommands,
    },

    /// Queue team member mutations
    Member {
        #[command(subcommand)]
        command: EntityCommands,
    },

    /// Queue comments
    Comment {
        #[command(subcommand)]
        command: CommentCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Queue / Dead-letter Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List queued operations in dispatch order
    List {
        /// Maximum operations to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeadLetterCommands {
    /// List dead-lettered operations
    List,

    /// Move an operation back to the end of the queue with a fresh retry budget
    Requeue {
        /// Operation ID
        id: String,
    },

    /// Drop every dead-lettered operation
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

// ============================================================================
// Flush
// ============================================================================

#[derive(Args, Debug)]
pub struct FlushArgs {
    /// Server base URL (overrides TFSYNC_SERVER and config.json)
    #[arg(long)]
    pub server: Option<String>,

    /// Bearer token (overrides TFSYNC_TOKEN and config.json)
    #[arg(long)]
    pub token: Option<String>,

    /// Keep flushing on the configured interval until Ctrl-C
    #[arg(short, long)]
    pub watch: bool,
}

// ============================================================================
// Entity Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum EntityCommands {
    /// Create an entity offline (prints its temporary ID)
    Create(EntityFieldArgs),

    /// Patch an entity
    Update {
        /// Entity ID (canonical or tmp_...)
        id: String,

        #[command(flatten)]
        fields: EntityFieldArgs,
    },

    /// Delete an entity
    Delete {
        /// Entity ID (canonical or tmp_...)
        id: String,
    },

    /// List records still waiting to sync
    List,
}

#[derive(Args, Debug, Default)]
pub struct EntityFieldArgs {
    /// Title (tasks, projects)
    #[arg(short, long)]
    pub title: Option<String>,

    /// Name (team members)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Status (e.g. todo, in_progress, done)
    #[arg(short, long)]
    pub status: Option<String>,

    /// Description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Due date (YYYY-MM-DD)
    #[arg(long)]
    pub due_date: Option<String>,

    /// Project ID this entity belongs to
    #[arg(short, long)]
    pub project: Option<String>,

    /// Team member ID assigned to this task
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Extra field as key=value (value parsed as JSON when possible)
    #[arg(short = 'f', long = "field", value_name = "KEY=VALUE")]
    pub extra: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum CommentCommands {
    /// Add a comment to a task
    Create {
        /// Task ID (canonical or tmp_...)
        #[arg(short, long)]
        task: String,

        /// Comment text
        body: String,
    },

    /// List comments still waiting to sync
    List,
}
