//! Queued mutation operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity::{EntityKind, References, Relation};
use super::id::{new_operation_id, EntityId};

/// What a queued operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateTask,
    UpdateTask,
    DeleteTask,
    CreateProject,
    UpdateProject,
    DeleteProject,
    CreateTeam,
    UpdateTeam,
    DeleteTeam,
    CreateComment,
}

/// Mutation verb, independent of the entity it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const ALL: [Self; 10] = [
        Self::CreateTask,
        Self::UpdateTask,
        Self::DeleteTask,
        Self::CreateProject,
        Self::UpdateProject,
        Self::DeleteProject,
        Self::CreateTeam,
        Self::UpdateTeam,
        Self::DeleteTeam,
        Self::CreateComment,
    ];

    /// Entity collection this operation mutates.
    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        match self {
            Self::CreateTask | Self::UpdateTask | Self::DeleteTask => EntityKind::Task,
            Self::CreateProject | Self::UpdateProject | Self::DeleteProject => EntityKind::Project,
            Self::CreateTeam | Self::UpdateTeam | Self::DeleteTeam => EntityKind::TeamMember,
            Self::CreateComment => EntityKind::Comment,
        }
    }

    #[must_use]
    pub const fn action(&self) -> Action {
        match self {
            Self::CreateTask | Self::CreateProject | Self::CreateTeam | Self::CreateComment => {
                Action::Create
            }
            Self::UpdateTask | Self::UpdateProject | Self::UpdateTeam => Action::Update,
            Self::DeleteTask | Self::DeleteProject | Self::DeleteTeam => Action::Delete,
        }
    }

    #[must_use]
    pub const fn is_create(&self) -> bool {
        matches!(self.action(), Action::Create)
    }

    /// Operation kind for `action` on `entity`, if the API supports it.
    ///
    /// Comments can only be created.
    #[must_use]
    pub const fn for_action(entity: EntityKind, action: Action) -> Option<Self> {
        match (entity, action) {
            (EntityKind::Task, Action::Create) => Some(Self::CreateTask),
            (EntityKind::Task, Action::Update) => Some(Self::UpdateTask),
            (EntityKind::Task, Action::Delete) => Some(Self::DeleteTask),
            (EntityKind::Project, Action::Create) => Some(Self::CreateProject),
            (EntityKind::Project, Action::Update) => Some(Self::UpdateProject),
            (EntityKind::Project, Action::Delete) => Some(Self::DeleteProject),
            (EntityKind::TeamMember, Action::Create) => Some(Self::CreateTeam),
            (EntityKind::TeamMember, Action::Update) => Some(Self::UpdateTeam),
            (EntityKind::TeamMember, Action::Delete) => Some(Self::DeleteTeam),
            (EntityKind::Comment, Action::Create) => Some(Self::CreateComment),
            (EntityKind::Comment, _) => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTask => "create_task",
            Self::UpdateTask => "update_task",
            Self::DeleteTask => "delete_task",
            Self::CreateProject => "create_project",
            Self::UpdateProject => "update_project",
            Self::DeleteProject => "delete_project",
            Self::CreateTeam => "create_team",
            Self::UpdateTeam => "update_team",
            Self::DeleteTeam => "delete_team",
            Self::CreateComment => "create_comment",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown operation kind: {s}"))
    }
}

/// A payload field that may carry another entity's identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefField {
    /// The operation's own subject: `clientId` for creates, `id` otherwise.
    Target,
    /// One of the relationship fields.
    Relation(Relation),
}

impl RefField {
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::Target => "id",
            Self::Relation(r) => r.wire_name(),
        }
    }
}

/// Kind-specific operation payload.
///
/// Creates: `target` is the client id, `refs`/`fields` the initial values.
/// Updates: `target` is the entity id, `refs`/`fields` the partial patch.
/// Deletes: `target` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub target: EntityId,
    #[serde(default, skip_serializing_if = "References::is_empty")]
    pub refs: References,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl Payload {
    #[must_use]
    pub fn new(target: EntityId) -> Self {
        Self {
            target,
            refs: References::default(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_refs(mut self, refs: References) -> Self {
        self.refs = refs;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn get(&self, field: RefField) -> Option<&EntityId> {
        match field {
            RefField::Target => Some(&self.target),
            RefField::Relation(r) => self.refs.get(r),
        }
    }

    pub fn get_mut(&mut self, field: RefField) -> Option<&mut EntityId> {
        match field {
            RefField::Target => Some(&mut self.target),
            RefField::Relation(r) => self.refs.get_mut(r),
        }
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Dead,
}

/// One queued client-side mutation, with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub payload: Payload,
    /// Enqueue time (Unix milliseconds). Ordering/debugging only.
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the next dispatch may happen (Unix milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
}

impl Operation {
    #[must_use]
    pub fn new(kind: OperationKind, payload: Payload) -> Self {
        Self {
            id: new_operation_id(),
            kind,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Client id minted for a create, `None` for updates and deletes.
    #[must_use]
    pub fn client_id(&self) -> Option<&EntityId> {
        self.kind.is_create().then_some(&self.payload.target)
    }

    /// Whether backoff allows dispatching at `now_ms`.
    #[must_use]
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_entity_and_action() {
        assert_eq!(OperationKind::CreateTeam.entity(), EntityKind::TeamMember);
        assert_eq!(OperationKind::DeleteProject.action(), Action::Delete);
        assert!(OperationKind::CreateComment.is_create());
        assert!(!OperationKind::UpdateTask.is_create());
    }

    #[test]
    fn test_for_action_covers_every_kind() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::for_action(kind.entity(), kind.action()), Some(kind));
        }
        assert_eq!(OperationKind::for_action(EntityKind::Comment, Action::Delete), None);
    }

    #[test]
    fn test_kind_parses_from_str() {
        assert_eq!("create_task".parse::<OperationKind>(), Ok(OperationKind::CreateTask));
        assert!("create_workspace".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_client_id_only_for_creates() {
        let tmp = EntityId::mint();
        let create = Operation::new(OperationKind::CreateProject, Payload::new(tmp.clone()));
        assert_eq!(create.client_id(), Some(&tmp));

        let delete = Operation::new(OperationKind::DeleteProject, Payload::new(tmp));
        assert_eq!(delete.client_id(), None);
    }

    #[test]
    fn test_is_due() {
        let mut op = Operation::new(OperationKind::DeleteTask, Payload::new(EntityId::canonical("t1")));
        assert!(op.is_due(0));
        op.next_attempt_at = Some(1_000);
        assert!(!op.is_due(999));
        assert!(op.is_due(1_000));
    }

    #[test]
    fn test_persisted_shape_is_camel_case() {
        let op = Operation::new(OperationKind::DeleteTask, Payload::new(EntityId::canonical("t1")));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "delete_task");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["status"], "pending");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastError").is_none());
    }
}
