//! Entity records shared by the optimistic mirror and the remote API.
//!
//! Tasks, projects, team members and comments all have the same shape: an
//! id, up to three relationship fields that may still hold temporary ids,
//! and free-form domain fields (title, status, dates, ...).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::id::EntityId;

/// Entity collections managed by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Project,
    TeamMember,
    Comment,
}

impl EntityKind {
    pub const ALL: [Self; 4] = [Self::Task, Self::Project, Self::TeamMember, Self::Comment];

    /// REST collection segment (`/api/<collection>`).
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Project => "projects",
            Self::TeamMember => "team",
            Self::Comment => "comments",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Project => write!(f, "project"),
            Self::TeamMember => write!(f, "team_member"),
            Self::Comment => write!(f, "comment"),
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "project" => Ok(Self::Project),
            "team_member" | "team" => Ok(Self::TeamMember),
            "comment" => Ok(Self::Comment),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

/// Relationship fields an entity may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    /// `projectId` → Project
    Project,
    /// `assigneeId` → TeamMember
    Assignee,
    /// `taskId` → Task
    Task,
}

impl Relation {
    pub const ALL: [Self; 3] = [Self::Project, Self::Assignee, Self::Task];

    /// Entity kind the relationship points at.
    #[must_use]
    pub const fn target_kind(&self) -> EntityKind {
        match self {
            Self::Project => EntityKind::Project,
            Self::Assignee => EntityKind::TeamMember,
            Self::Task => EntityKind::Task,
        }
    }

    /// camelCase wire name.
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::Project => "projectId",
            Self::Assignee => "assigneeId",
            Self::Task => "taskId",
        }
    }
}

/// Relationship fields. Any of them may still be a temporary id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct References {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<EntityId>,
}

impl References {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.project_id.is_none() && self.assignee_id.is_none() && self.task_id.is_none()
    }

    #[must_use]
    pub fn get(&self, relation: Relation) -> Option<&EntityId> {
        match relation {
            Relation::Project => self.project_id.as_ref(),
            Relation::Assignee => self.assignee_id.as_ref(),
            Relation::Task => self.task_id.as_ref(),
        }
    }

    pub fn get_mut(&mut self, relation: Relation) -> Option<&mut EntityId> {
        match relation {
            Relation::Project => self.project_id.as_mut(),
            Relation::Assignee => self.assignee_id.as_mut(),
            Relation::Task => self.task_id.as_mut(),
        }
    }

    /// Overlay `patch` on top of `self`: fields set in the patch win.
    pub fn apply_patch(&mut self, patch: &Self) {
        if patch.project_id.is_some() {
            self.project_id.clone_from(&patch.project_id);
        }
        if patch.assignee_id.is_some() {
            self.assignee_id.clone_from(&patch.assignee_id);
        }
        if patch.task_id.is_some() {
            self.task_id.clone_from(&patch.task_id);
        }
    }

    /// Replace every occurrence of `from` with `to`. Returns the number of
    /// fields rewritten.
    pub fn rewrite(&mut self, from: &EntityId, to: &EntityId) -> usize {
        let mut rewritten = 0;
        for relation in Relation::ALL {
            if let Some(slot) = self.get_mut(relation) {
                if slot == from {
                    slot.clone_from(to);
                    rewritten += 1;
                }
            }
        }
        rewritten
    }
}

/// One entity as held by the optimistic mirror or returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    #[serde(default)]
    pub refs: References,
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// True while the record only exists optimistically (not yet confirmed).
    #[serde(default)]
    pub pending: bool,
    /// Last local change (Unix milliseconds).
    pub updated_at: i64,
}

impl EntityRecord {
    /// A confirmed record as received from the server.
    #[must_use]
    pub fn confirmed(id: EntityId, refs: References, fields: Map<String, Value>) -> Self {
        Self {
            id,
            refs,
            fields,
            pending: false,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// String value of a domain field, if present.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Display title (`title` for tasks, `name` for projects and members,
    /// `body` for comments).
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.text("title")
            .or_else(|| self.text("name"))
            .or_else(|| self.text("body"))
    }
}

/// Content signature used to pair an optimistic record with an
/// independently fetched server record when ids do not match.
///
/// Returns `None` when the record lacks the text the signature is built
/// from; such records are only ever matched by id.
#[must_use]
pub fn content_signature(kind: EntityKind, record: &EntityRecord) -> Option<String> {
    let refs = &record.refs;
    let wire = |id: Option<&EntityId>| id.map(EntityId::to_wire).unwrap_or_default();
    let date = |name: &str| record.text(name).unwrap_or_default().trim().to_string();

    let parts: Vec<String> = match kind {
        EntityKind::Task => vec![
            normalize(record.text("title")?),
            wire(refs.project_id.as_ref()),
            date("startDate"),
            date("dueDate"),
        ],
        EntityKind::Project => vec![
            normalize(record.text("name")?),
            date("workspaceId"),
            date("startDate"),
            date("endDate"),
        ],
        EntityKind::TeamMember => {
            vec![normalize(record.text("email").or_else(|| record.text("name"))?)]
        }
        EntityKind::Comment => vec![
            wire(refs.task_id.as_ref()),
            normalize(record.text("body")?),
        ],
    };

    if parts[0].is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(kind.collection().as_bytes());
    for part in &parts {
        hasher.update([0x1f]);
        hasher.update(part.as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Lowercase and collapse whitespace.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: EntityId, title: &str, project: Option<EntityId>) -> EntityRecord {
        let mut fields = Map::new();
        fields.insert("title".into(), json!(title));
        fields.insert("dueDate".into(), json!("2025-03-01"));
        EntityRecord::confirmed(
            id,
            References {
                project_id: project,
                ..References::default()
            },
            fields,
        )
    }

    #[test]
    fn test_signature_ignores_case_and_whitespace() {
        let p = Some(EntityId::canonical("p1"));
        let a = task(EntityId::mint(), "  Write   Report ", p.clone());
        let b = task(EntityId::canonical("t9"), "write report", p);
        assert_eq!(
            content_signature(EntityKind::Task, &a),
            content_signature(EntityKind::Task, &b)
        );
    }

    #[test]
    fn test_signature_depends_on_project() {
        let a = task(EntityId::mint(), "Report", Some(EntityId::canonical("p1")));
        let b = task(EntityId::mint(), "Report", Some(EntityId::canonical("p2")));
        assert_ne!(
            content_signature(EntityKind::Task, &a),
            content_signature(EntityKind::Task, &b)
        );
    }

    #[test]
    fn test_signature_requires_title() {
        let record = EntityRecord::confirmed(EntityId::mint(), References::default(), Map::new());
        assert!(content_signature(EntityKind::Task, &record).is_none());
    }

    #[test]
    fn test_references_rewrite_all_occurrences() {
        let tmp = EntityId::mint();
        let canonical = EntityId::canonical("m1");
        let mut refs = References {
            project_id: Some(EntityId::canonical("p1")),
            assignee_id: Some(tmp.clone()),
            task_id: None,
        };
        assert_eq!(refs.rewrite(&tmp, &canonical), 1);
        assert_eq!(refs.assignee_id, Some(canonical.clone()));
        assert_eq!(refs.rewrite(&tmp, &canonical), 0);
        assert_eq!(refs.project_id, Some(EntityId::canonical("p1")));
    }

    #[test]
    fn test_apply_patch_keeps_unset_fields() {
        let mut refs = References {
            project_id: Some(EntityId::canonical("p1")),
            ..References::default()
        };
        refs.apply_patch(&References {
            assignee_id: Some(EntityId::canonical("m1")),
            ..References::default()
        });
        assert_eq!(refs.project_id, Some(EntityId::canonical("p1")));
        assert_eq!(refs.assignee_id, Some(EntityId::canonical("m1")));
    }

    #[test]
    fn test_entity_kind_round_trip_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.to_string().parse::<EntityKind>().unwrap(), kind);
        }
    }
}
