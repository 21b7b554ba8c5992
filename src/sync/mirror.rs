//! Optimistic entity mirror.
//!
//! In-memory copies of tasks, projects, team members and comments. Local
//! mutations land here immediately; server results replace the optimistic
//! records later. A merge never appends a second copy of an entity: the
//! existing record is found by id first, then by content signature.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::model::{content_signature, EntityId, EntityKind, EntityRecord, References};

/// A change applied locally before the server confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    /// New entity under a client-minted temporary id.
    Create {
        id: EntityId,
        refs: References,
        fields: Map<String, Value>,
    },
    /// Partial patch: set relationship fields and domain fields win.
    Update {
        id: EntityId,
        refs: References,
        fields: Map<String, Value>,
    },
    Delete { id: EntityId },
}

/// How a server record was merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Replaced the record previously known as `previous`.
    Replaced { previous: EntityId },
    /// No local counterpart; the record was added.
    Inserted,
}

impl MergeOutcome {
    /// The `(old, new)` id pair when the merge changed an identifier.
    #[must_use]
    pub fn id_change<'a>(&'a self, current: &'a EntityId) -> Option<(&'a EntityId, &'a EntityId)> {
        match self {
            Self::Replaced { previous } if previous != current => Some((previous, current)),
            _ => None,
        }
    }
}

/// Per-kind collections of [`EntityRecord`]s, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct EntityMirror {
    collections: HashMap<EntityKind, Vec<EntityRecord>>,
}

impl EntityMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `kind`, in insertion order.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> &[EntityRecord] {
        self.collections.get(&kind).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<&EntityRecord> {
        self.list(kind).iter().find(|r| &r.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collection_mut(&mut self, kind: EntityKind) -> &mut Vec<EntityRecord> {
        self.collections.entry(kind).or_default()
    }

    /// Apply a local mutation. Returns `false` if an update or delete
    /// targeted a record the mirror does not hold.
    pub fn apply_local(&mut self, kind: EntityKind, mutation: LocalMutation) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        match mutation {
            LocalMutation::Create { id, refs, fields } => {
                let record = EntityRecord {
                    id,
                    refs,
                    fields,
                    pending: true,
                    updated_at: now,
                };
                let collection = self.collection_mut(kind);
                match collection.iter_mut().find(|r| r.id == record.id) {
                    Some(existing) => *existing = record,
                    None => collection.push(record),
                }
                true
            }
            LocalMutation::Update { id, refs, fields } => {
                let Some(record) = self.collection_mut(kind).iter_mut().find(|r| r.id == id) else {
                    return false;
                };
                record.refs.apply_patch(&refs);
                record.fields.extend(fields);
                record.pending = true;
                record.updated_at = now;
                true
            }
            LocalMutation::Delete { id } => self.remove(kind, &id),
        }
    }

    /// Remove a record. Deleting a task also drops its comments.
    pub fn remove(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let collection = self.collection_mut(kind);
        let before = collection.len();
        collection.retain(|r| &r.id != id);
        let removed = collection.len() != before;

        if kind == EntityKind::Task {
            self.collection_mut(EntityKind::Comment)
                .retain(|c| c.refs.task_id.as_ref() != Some(id));
        }
        removed
    }

    /// Merge a confirmed server record.
    ///
    /// The local counterpart is looked up by `temp` (the client id the
    /// create was sent with), then by the record's id, then by content
    /// signature among pending records. The counterpart is replaced in
    /// place; any other copy carrying the same id is dropped.
    pub fn merge_server_result(
        &mut self,
        kind: EntityKind,
        temp: Option<&EntityId>,
        record: EntityRecord,
    ) -> MergeOutcome {
        let signature = content_signature(kind, &record);
        let collection = self.collection_mut(kind);

        let index = temp
            .and_then(|t| collection.iter().position(|r| &r.id == t))
            .or_else(|| collection.iter().position(|r| r.id == record.id))
            .or_else(|| {
                let signature = signature.as_ref()?;
                collection.iter().position(|r| {
                    r.pending
                        && r.id.is_temporary()
                        && content_signature(kind, r).as_ref() == Some(signature)
                })
            });

        let Some(index) = index else {
            collection.push(record);
            return MergeOutcome::Inserted;
        };

        let previous = std::mem::replace(&mut collection[index], record);
        let id = collection[index].id.clone();
        let mut position = 0;
        collection.retain(|r| {
            let keep = position == index || r.id != id;
            position += 1;
            keep
        });
        MergeOutcome::Replaced {
            previous: previous.id,
        }
    }

    /// Merge an independently fetched server snapshot of `kind`.
    ///
    /// Confirmed records missing from the snapshot are dropped; pending ones
    /// survive until their own operation resolves. Returns the id changes
    /// the merge produced.
    pub fn apply_snapshot(
        &mut self,
        kind: EntityKind,
        records: Vec<EntityRecord>,
    ) -> Vec<(EntityId, EntityId)> {
        let ids: Vec<EntityId> = records.iter().map(|r| r.id.clone()).collect();
        let mut changes = Vec::new();
        for record in records {
            let current = record.id.clone();
            let outcome = self.merge_server_result(kind, None, record);
            if let Some((old, new)) = outcome.id_change(&current) {
                changes.push((old.clone(), new.clone()));
            }
        }
        self.collection_mut(kind)
            .retain(|r| r.pending || ids.contains(&r.id));
        changes
    }

    /// Replace `from` with `to` wherever it appears: record ids and
    /// relationship fields of every collection. Returns fields rewritten.
    pub fn rewrite_references(&mut self, from: &EntityId, to: &EntityId) -> usize {
        let mut rewritten = 0;
        for record in self.collections.values_mut().flatten() {
            if &record.id == from {
                record.id.clone_from(to);
                rewritten += 1;
            }
            rewritten += record.refs.rewrite(from, to);
        }
        rewritten
    }
}
