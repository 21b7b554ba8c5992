//! Realtime cache invalidation.
//!
//! The server pushes `{type}` events (`task.updated`, `project.deleted`, ...)
//! over a realtime channel. Each event names the read view that is now
//! stale; the listener forwards that to a [`CacheInvalidator`] scoped to the
//! workspace/project the UI is looking at. The engine uses the same
//! invalidator after every flush batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::cancel::CancelToken;
use crate::model::EntityKind;

/// Externally owned read caches that can be re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadView {
    Tasks,
    Projects,
    Team,
    Comments,
}

impl ReadView {
    /// View affected by an event type, by prefix (`task.`, `project.`,
    /// `team.`, `comment.`).
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let (prefix, _) = event_type.split_once('.')?;
        match prefix {
            "task" => Some(Self::Tasks),
            "project" => Some(Self::Projects),
            "team" => Some(Self::Team),
            "comment" => Some(Self::Comments),
            _ => None,
        }
    }
}

impl From<EntityKind> for ReadView {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Task => Self::Tasks,
            EntityKind::Project => Self::Projects,
            EntityKind::TeamMember => Self::Team,
            EntityKind::Comment => Self::Comments,
        }
    }
}

impl std::fmt::Display for ReadView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tasks => write!(f, "tasks"),
            Self::Projects => write!(f, "projects"),
            Self::Team => write!(f, "team"),
            Self::Comments => write!(f, "comments"),
        }
    }
}

/// Workspace/project the UI currently displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Re-fetch trigger for externally owned read caches.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, view: ReadView, scope: &InvalidationScope);
}

/// Inbound realtime message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RealtimeEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: None,
        }
    }
}

/// Route one event. Returns the invalidated view, or `None` for events no
/// view cares about.
pub fn handle_event(
    event: &RealtimeEvent,
    invalidator: &dyn CacheInvalidator,
    scope: &InvalidationScope,
) -> Option<ReadView> {
    let Some(view) = ReadView::from_event_type(&event.event_type) else {
        tracing::trace!(event_type = %event.event_type, "Ignoring realtime event");
        return None;
    };
    tracing::debug!(event_type = %event.event_type, %view, "Realtime invalidation");
    invalidator.invalidate(view, scope);
    Some(view)
}

/// Consume `events` until the channel closes or `cancel` fires. The scope
/// is read from `scope` at each event so it follows the UI. Returns the
/// number of invalidations issued.
pub async fn run_listener(
    mut events: mpsc::Receiver<RealtimeEvent>,
    invalidator: std::sync::Arc<dyn CacheInvalidator>,
    scope: watch::Receiver<InvalidationScope>,
    cancel: CancelToken,
) -> usize {
    let mut invalidations = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let scope = scope.borrow().clone();
                if handle_event(&event, invalidator.as_ref(), &scope).is_some() {
                    invalidations += 1;
                }
            }
        }
    }
    tracing::debug!(invalidations, "Realtime listener stopped");
    invalidations
}
