//! Offline mutation commands for tasks, projects, team members and comments.
//!
//! Every command only queues: the change is persisted and applied to the
//! local mirror, and reaches the server on the next `tfsync flush`.

use colored::Colorize;
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::open_engine;
use crate::cli::{CommentCommands, EntityCommands, EntityFieldArgs};
use crate::error::{Error, Result};
use crate::model::{EntityId, EntityKind, EntityRecord, References};

/// Execute task commands.
pub fn execute_task(command: &EntityCommands, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    execute(EntityKind::Task, command, store_path, json)
}

/// Execute project commands.
pub fn execute_project(
    command: &EntityCommands,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    execute(EntityKind::Project, command, store_path, json)
}

/// Execute team member commands.
pub fn execute_member(
    command: &EntityCommands,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    execute(EntityKind::TeamMember, command, store_path, json)
}

/// Execute comment commands.
pub fn execute_comment(
    command: &CommentCommands,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    match command {
        CommentCommands::Create { task, body } => {
            if body.trim().is_empty() {
                return Err(Error::InvalidArgument("Comment body cannot be empty".to_string()));
            }
            let refs = References {
                task_id: Some(EntityId::from_wire(task)),
                ..References::default()
            };
            let mut fields = Map::new();
            fields.insert("body".to_string(), Value::String(body.clone()));
            create(EntityKind::Comment, refs, fields, store_path, json)
        }
        CommentCommands::List => list(EntityKind::Comment, store_path, json),
    }
}

fn execute(
    kind: EntityKind,
    command: &EntityCommands,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    match command {
        EntityCommands::Create(args) => {
            let (refs, fields) = parse_fields(args)?;
            require_label(kind, &fields)?;
            create(kind, refs, fields, store_path, json)
        }
        EntityCommands::Update { id, fields } => update(kind, id, fields, store_path, json),
        EntityCommands::Delete { id } => delete(kind, id, store_path, json),
        EntityCommands::List => list(kind, store_path, json),
    }
}

fn create(
    kind: EntityKind,
    refs: References,
    fields: Map<String, Value>,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let engine = open_engine(store_path, true)?;
    let id = engine.create(kind, refs, fields)?;

    if json {
        let output = serde_json::json!({
            "id": id.to_wire(),
            "kind": kind,
            "pending": engine.pending_count(),
        });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Queued {kind} {}", id.to_string().cyan());
        println!("  Pending: {}", engine.pending_count());
    }
    Ok(())
}

fn update(
    kind: EntityKind,
    id: &str,
    args: &EntityFieldArgs,
    store_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let (refs, fields) = parse_fields(args)?;
    let engine = open_engine(store_path, true)?;
    let op_id = engine.update(kind, EntityId::from_wire(id), refs, fields)?;
    print_queued("update", kind, id, &op_id, engine.pending_count(), json)
}

fn delete(kind: EntityKind, id: &str, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, true)?;
    let op_id = engine.delete(kind, EntityId::from_wire(id))?;
    print_queued("delete", kind, id, &op_id, engine.pending_count(), json)
}

fn print_queued(
    action: &str,
    kind: EntityKind,
    id: &str,
    op_id: &str,
    pending: usize,
    json: bool,
) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "operation": op_id,
            "action": action,
            "kind": kind,
            "id": id,
            "pending": pending,
        });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Queued {action} of {kind} {} ({})", id.cyan(), op_id.dimmed());
        println!("  Pending: {pending}");
    }
    Ok(())
}

fn list(kind: EntityKind, store_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(store_path, false)?;
    let records: Vec<EntityRecord> = engine.list(kind);

    if json {
        let output = serde_json::json!({
            "kind": kind,
            "records": records,
            "count": records.len(),
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No pending {kind} records.");
        return Ok(());
    }

    for record in &records {
        let marker = if record.pending { "*".yellow() } else { " ".normal() };
        println!(
            "{marker} {} {}",
            record.id.to_string().cyan(),
            record.title().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

/// Split CLI flags into relationship references and domain fields.
///
/// `--field key=value` values are parsed as JSON when they parse, so
/// `--field priority=2` stores a number and `--field label=urgent` a string.
fn parse_fields(args: &EntityFieldArgs) -> Result<(References, Map<String, Value>)> {
    let refs = References {
        project_id: args.project.as_deref().map(EntityId::from_wire),
        assignee_id: args.assignee.as_deref().map(EntityId::from_wire),
        task_id: None,
    };

    let mut fields = Map::new();
    let named = [
        ("title", &args.title),
        ("name", &args.name),
        ("status", &args.status),
        ("description", &args.description),
        ("dueDate", &args.due_date),
    ];
    for (key, value) in named {
        if let Some(value) = value {
            fields.insert(key.to_string(), Value::String(value.clone()));
        }
    }

    for raw in &args.extra {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("Expected KEY=VALUE, got '{raw}'")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidArgument(format!("Empty field name in '{raw}'")));
        }
        if matches!(key, "id" | "clientId" | "projectId" | "assigneeId" | "taskId") {
            return Err(Error::InvalidArgument(format!(
                "'{key}' cannot be set with --field"
            )));
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }

    Ok((refs, fields))
}

/// New tasks and projects need a title or name, members a name or email.
fn require_label(kind: EntityKind, fields: &Map<String, Value>) -> Result<()> {
    let has = |key: &str| fields.get(key).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty());
    let ok = match kind {
        EntityKind::Task => has("title"),
        EntityKind::Project => has("name") || has("title"),
        EntityKind::TeamMember => has("name") || has("email"),
        EntityKind::Comment => has("body"),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "A new {kind} needs {}",
            match kind {
                EntityKind::Task => "--title",
                EntityKind::Project => "--name",
                EntityKind::TeamMember => "--name or --field email=...",
                EntityKind::Comment => "a body",
            }
        )))
    }
}
