//! Dead-letter store.
//!
//! Append-only record of operations the engine gave up on, persisted under
//! [`DEAD_LETTER_KEY`] separately from the active queue so they can be
//! inspected (or requeued by an operator) without blocking live work.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::classify::DeadLetterReason;
use crate::error::{Error, Result};
use crate::model::{Operation, OperationStatus};
use crate::storage::{self, KvStore, DEAD_LETTER_KEY};

/// One abandoned operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// The operation as it was when abandoned (status `dead`).
    pub operation: Operation,
    /// Last error message.
    pub error: String,
    pub retry_count: u32,
    pub reason: DeadLetterReason,
    /// When it was dead-lettered (Unix milliseconds).
    pub timestamp: i64,
}

impl DeadLetterRecord {
    #[must_use]
    pub fn new(mut operation: Operation, error: String, reason: DeadLetterReason) -> Self {
        operation.status = OperationStatus::Dead;
        operation.last_error = Some(error.clone());
        operation.next_attempt_at = None;
        Self {
            retry_count: operation.retry_count,
            operation,
            error,
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Persisted list of [`DeadLetterRecord`]s.
pub struct DeadLetterStore {
    store: Arc<dyn KvStore>,
    records: Vec<DeadLetterRecord>,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    /// Rehydrate from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted list cannot be read or decoded.
    pub fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let records = storage::load(store.as_ref(), DEAD_LETTER_KEY)?.unwrap_or_default();
        Ok(Self { store, records })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[DeadLetterRecord] {
        &self.records
    }

    #[must_use]
    pub fn contains(&self, op_id: &str) -> bool {
        self.records.iter().any(|r| r.operation.id == op_id)
    }

    /// Append a record and persist.
    ///
    /// # Errors
    ///
    /// Returns the storage error if persisting fails.
    pub fn append(&mut self, record: DeadLetterRecord) -> Result<()> {
        self.push(record);
        self.persist()
    }

    /// Append without persisting; the caller writes it with the queue.
    pub(crate) fn push(&mut self, record: DeadLetterRecord) {
        self.records.push(record);
    }

    /// Remove a record so its operation can be requeued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationNotFound`] if no record has that operation id,
    /// or the storage error if persisting fails.
    pub fn take(&mut self, op_id: &str) -> Result<DeadLetterRecord> {
        let index = self
            .records
            .iter()
            .position(|r| r.operation.id == op_id)
            .ok_or_else(|| Error::OperationNotFound {
                id: op_id.to_string(),
            })?;
        let record = self.records.remove(index);
        self.persist()?;
        Ok(record)
    }

    /// Drop every record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the storage error if persisting fails.
    pub fn clear(&mut self) -> Result<usize> {
        let count = self.records.len();
        self.records.clear();
        self.persist()?;
        Ok(count)
    }

    /// Serialized form, for multi-key writes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encoded(&self) -> Result<String> {
        storage::encode(&self.records)
    }

    /// Overwrite the persisted list with the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the write fails.
    pub fn persist(&self) -> Result<()> {
        self.store.put(DEAD_LETTER_KEY, &self.encoded()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityId, OperationKind, Payload};
    use crate::storage::MemoryKvStore;

    fn dead(reason: DeadLetterReason) -> DeadLetterRecord {
        let mut op = Operation::new(OperationKind::UpdateTask, Payload::new(EntityId::canonical("t1")));
        op.retry_count = 2;
        DeadLetterRecord::new(op, "boom".into(), reason)
    }

    #[test]
    fn test_record_marks_operation_dead() {
        let record = dead(DeadLetterReason::RetryExhausted);
        assert_eq!(record.operation.status, OperationStatus::Dead);
        assert_eq!(record.operation.last_error.as_deref(), Some("boom"));
        assert_eq!(record.retry_count, 2);
    }

    #[test]
    fn test_append_survives_reload() {
        let store = Arc::new(MemoryKvStore::new());
        let mut letters = DeadLetterStore::load(store.clone()).unwrap();
        let record = dead(DeadLetterReason::Unrecoverable);
        let op_id = record.operation.id.clone();
        letters.append(record).unwrap();

        let reloaded = DeadLetterStore::load(store).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains(&op_id));
        assert_eq!(reloaded.records()[0].reason, DeadLetterReason::Unrecoverable);
    }

    #[test]
    fn test_take_and_clear() {
        let store = Arc::new(MemoryKvStore::new());
        let mut letters = DeadLetterStore::load(store).unwrap();
        let first = dead(DeadLetterReason::Unrecoverable);
        let first_id = first.operation.id.clone();
        letters.append(first).unwrap();
        letters.append(dead(DeadLetterReason::RetryExhausted)).unwrap();

        assert!(matches!(
            letters.take("op_missing"),
            Err(Error::OperationNotFound { .. })
        ));
        assert_eq!(letters.take(&first_id).unwrap().operation.id, first_id);
        assert_eq!(letters.clear().unwrap(), 1);
        assert!(letters.is_empty());
    }
}
