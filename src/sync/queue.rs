//! Durable operation queue.
//!
//! Ordered list of pending operations, persisted as a whole under
//! [`ACTIVE_QUEUE_KEY`] after every mutating call. New work only enters
//! through [`QueueStore::append`]; entries are never reordered, only
//! rewritten in place by reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{EntityId, Operation};
use crate::storage::{self, KvStore, ACTIVE_QUEUE_KEY};

/// Result of an [`QueueStore::append`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The operation was queued and persisted.
    Appended,
    /// A create with the same client id is already queued; nothing changed.
    Duplicate { existing: String },
}

/// FIFO queue of pending operations backed by a [`KvStore`].
pub struct QueueStore {
    store: Arc<dyn KvStore>,
    entries: Vec<Operation>,
    max_depth: usize,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("entries", &self.entries.len())
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Rehydrate the queue from `store` (empty if nothing was persisted).
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted queue cannot be read or decoded.
    pub fn load(store: Arc<dyn KvStore>, max_depth: usize) -> Result<Self> {
        let entries: Vec<Operation> = storage::load(store.as_ref(), ACTIVE_QUEUE_KEY)?.unwrap_or_default();
        tracing::debug!(pending = entries.len(), "Loaded operation queue");
        Ok(Self {
            store,
            entries,
            max_depth,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Append `op` at the back and persist before returning.
    ///
    /// A create whose client id is already queued is not appended again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] at the depth limit, or the storage error
    /// if persisting fails (the operation is then not queued).
    pub fn append(&mut self, op: Operation) -> Result<AppendOutcome> {
        if let Some(client_id) = op.client_id() {
            if let Some(existing) = self.find_create(client_id) {
                return Ok(AppendOutcome::Duplicate {
                    existing: existing.id.clone(),
                });
            }
        }

        if self.entries.len() >= self.max_depth {
            return Err(Error::QueueFull {
                depth: self.entries.len(),
                limit: self.max_depth,
            });
        }

        self.entries.push(op);
        if let Err(e) = self.persist() {
            self.entries.pop();
            return Err(e);
        }
        Ok(AppendOutcome::Appended)
    }

    #[must_use]
    pub fn peek_front(&self) -> Option<&Operation> {
        self.entries.first()
    }

    /// Mutable access to the head, for retry bookkeeping. Call
    /// [`persist`](Self::persist) afterwards.
    pub fn front_mut(&mut self) -> Option<&mut Operation> {
        self.entries.first_mut()
    }

    /// Remove the head and persist.
    ///
    /// # Errors
    ///
    /// Returns the storage error if persisting fails. The head is removed in
    /// memory regardless; the next successful persist records it.
    pub fn remove_front(&mut self) -> Result<Option<Operation>> {
        let removed = self.take_front();
        self.persist()?;
        Ok(removed)
    }

    /// Remove the head without persisting. The caller persists the queue
    /// together with whatever else changed.
    pub(crate) fn take_front(&mut self) -> Option<Operation> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Ordered copy of every queued operation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Operation> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    /// In-place access for reconciliation. Order must not change.
    pub(crate) fn entries_mut(&mut self) -> &mut [Operation] {
        &mut self.entries
    }

    /// Queued create that minted `client_id`, if any.
    #[must_use]
    pub fn find_create(&self, client_id: &EntityId) -> Option<&Operation> {
        self.entries
            .iter()
            .find(|op| op.client_id() == Some(client_id))
    }

    /// Drop entries whose operation id is in `ids`. Returns how many were dropped.
    pub(crate) fn drop_ids(&mut self, ids: &HashSet<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|op| !ids.contains(op.id.as_str()));
        before - self.entries.len()
    }

    /// Serialized form, for multi-key writes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encoded(&self) -> Result<String> {
        storage::encode(&self.entries)
    }

    /// Overwrite the persisted queue with the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the write fails.
    pub fn persist(&self) -> Result<()> {
        self.store.put(ACTIVE_QUEUE_KEY, &self.encoded()?)
    }
}
