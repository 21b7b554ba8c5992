//! Identifier reconciliation.
//!
//! Queued operations may reference entities that only exist optimistically.
//! Once the server confirms a create, the temporary id is recorded in the
//! [`IdMap`] and every remaining queue entry is rewritten to the canonical id
//! before anything else is dispatched.
//!
//! Which payload fields can hold which entity's id is declared once, in
//! [`DEPENDENCY_SCHEMA`]; a single routine walks it for every rewrite.

use std::collections::HashMap;

use crate::error::Result;
use crate::model::{
    EntityId, EntityKind, Operation, OperationKind, Payload, RefField, References, Relation,
};
use crate::storage::{self, KvStore, ID_MAP_KEY};

/// `(operation kind, payload field) → entity kind the field references`.
///
/// Creates do not list [`RefField::Target`]: their target is the client id
/// the server uses as an idempotency key and must survive redelivery.
pub const DEPENDENCY_SCHEMA: &[(OperationKind, RefField, EntityKind)] = &[
    (OperationKind::CreateTask, RefField::Relation(Relation::Project), EntityKind::Project),
    (OperationKind::CreateTask, RefField::Relation(Relation::Assignee), EntityKind::TeamMember),
    (OperationKind::UpdateTask, RefField::Target, EntityKind::Task),
    (OperationKind::UpdateTask, RefField::Relation(Relation::Project), EntityKind::Project),
    (OperationKind::UpdateTask, RefField::Relation(Relation::Assignee), EntityKind::TeamMember),
    (OperationKind::DeleteTask, RefField::Target, EntityKind::Task),
    (OperationKind::UpdateProject, RefField::Target, EntityKind::Project),
    (OperationKind::DeleteProject, RefField::Target, EntityKind::Project),
    (OperationKind::UpdateTeam, RefField::Target, EntityKind::TeamMember),
    (OperationKind::DeleteTeam, RefField::Target, EntityKind::TeamMember),
    (OperationKind::CreateComment, RefField::Relation(Relation::Task), EntityKind::Task),
];

/// Fields of `kind` that may reference another entity.
pub fn dependency_fields(kind: OperationKind) -> impl Iterator<Item = (RefField, EntityKind)> {
    DEPENDENCY_SCHEMA
        .iter()
        .filter(move |(k, _, _)| *k == kind)
        .map(|(_, field, target)| (*field, *target))
}

/// Relationship fields set on `refs` that `kind` does not declare.
///
/// A field missing from the schema would never be rewritten or checked, so
/// the engine refuses to queue it.
#[must_use]
pub fn undeclared_relations(kind: OperationKind, refs: &References) -> Vec<Relation> {
    Relation::ALL
        .into_iter()
        .filter(|relation| refs.get(*relation).is_some())
        .filter(|relation| {
            !dependency_fields(kind).any(|(field, _)| field == RefField::Relation(*relation))
        })
        .collect()
}

/// Temporary → canonical identifier map.
///
/// Write-once per temporary id and never shrinks; persisted under
/// [`ID_MAP_KEY`] so later processes can still resolve references.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdMap {
    entries: HashMap<String, String>,
}

impl IdMap {
    /// Load the persisted map (empty if absent).
    ///
    /// # Errors
    ///
    /// Returns an error if the stored map cannot be read or decoded.
    pub fn load(store: &dyn KvStore) -> Result<Self> {
        let entries = storage::load(store, ID_MAP_KEY)?.unwrap_or_default();
        Ok(Self { entries })
    }

    /// Persist the whole map.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the write fails.
    pub fn persist(&self, store: &dyn KvStore) -> Result<()> {
        store.put(ID_MAP_KEY, &self.encoded()?)
    }

    /// Serialized form, for multi-key writes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encoded(&self) -> Result<String> {
        storage::encode(&self.entries)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `temp → canonical`. Returns `false` if `temp` was already
    /// mapped (the first mapping is kept) or is not temporary.
    pub fn insert(&mut self, temp: &EntityId, canonical: &str) -> bool {
        let EntityId::Temporary(token) = temp else {
            return false;
        };
        match self.entries.get(token) {
            Some(existing) if existing == canonical => false,
            Some(existing) => {
                tracing::warn!(
                    temp = %temp,
                    existing = %existing,
                    ignored = canonical,
                    "Temporary id already mapped; keeping first mapping"
                );
                false
            }
            None => {
                self.entries.insert(token.clone(), canonical.to_string());
                true
            }
        }
    }

    /// Canonical id for `id`: itself if already canonical, the mapping if
    /// one exists, `None` otherwise.
    #[must_use]
    pub fn resolve(&self, id: &EntityId) -> Option<EntityId> {
        match id {
            EntityId::Canonical(_) => Some(id.clone()),
            EntityId::Temporary(token) => self.entries.get(token).map(EntityId::canonical),
        }
    }
}

/// Rewrite every reference to `temp` (an id of `created`) in `entries`.
///
/// Only fields the schema declares as referencing `created` are touched.
/// Idempotent: a second call finds nothing left to rewrite. Returns the
/// number of fields rewritten.
pub fn reconcile_queue(
    entries: &mut [Operation],
    created: EntityKind,
    temp: &EntityId,
    canonical: &EntityId,
) -> usize {
    let mut rewritten = 0;
    for op in entries.iter_mut() {
        for (field, target) in dependency_fields(op.kind) {
            if target != created {
                continue;
            }
            if let Some(slot) = op.payload.get_mut(field) {
                if slot == temp {
                    slot.clone_from(canonical);
                    rewritten += 1;
                    tracing::debug!(
                        op_id = %op.id,
                        kind = %op.kind,
                        field = field.wire_name(),
                        canonical = %canonical,
                        "Rewrote queued reference"
                    );
                }
            }
        }
    }
    rewritten
}

/// Rewrite any temporary references in `payload` the map already resolves.
/// Returns the number of fields rewritten.
pub fn resolve_payload(kind: OperationKind, payload: &mut Payload, map: &IdMap) -> usize {
    let mut rewritten = 0;
    for (field, _) in dependency_fields(kind) {
        if let Some(slot) = payload.get_mut(field) {
            if slot.is_temporary() {
                if let Some(canonical) = map.resolve(slot) {
                    *slot = canonical;
                    rewritten += 1;
                }
            }
        }
    }
    rewritten
}

/// Dependency fields of `kind` that still hold temporary ids.
#[must_use]
pub fn unresolved(kind: OperationKind, payload: &Payload) -> Vec<(RefField, EntityKind, EntityId)> {
    dependency_fields(kind)
        .filter_map(|(field, target)| {
            payload
                .get(field)
                .filter(|id| id.is_temporary())
                .map(|id| (field, target, id.clone()))
        })
        .collect()
}
