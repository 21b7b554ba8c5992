//! The sync engine.
//!
//! One object owns the queue, dead-letter store, identifier map and entity
//! mirror. Callers mutate through [`SyncEngine::create`] / [`update`] /
//! [`delete`], which apply the change optimistically and queue it; the
//! scheduler (or a manual trigger) calls [`SyncEngine::attempt_flush`] to
//! drain the queue against the remote API.
//!
//! State lives behind one `std::sync::Mutex` that is never held across an
//! `.await`: each dispatch clones the head operation, releases the lock,
//! awaits the server, then re-locks to apply the result.
//!
//! [`update`]: SyncEngine::update
//! [`delete`]: SyncEngine::delete

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::watch;

use super::api::{ApiError, CreateRequest, RemoteApi, ServerRecord, UpdateRequest, WireRefs};
use super::cancel::CancelToken;
use super::classify::{DeadLetterReason, FailureAction};
use super::dead_letter::{DeadLetterRecord, DeadLetterStore};
use super::mirror::{EntityMirror, LocalMutation};
use super::queue::{AppendOutcome, QueueStore};
use super::realtime::{CacheInvalidator, InvalidationScope, ReadView};
use super::reconcile::{reconcile_queue, resolve_payload, undeclared_relations, unresolved, IdMap};
use super::types::{EngineSettings, FlushReport, SyncPhase, SyncStatus};
use crate::error::{Error, Result};
use crate::model::{
    Action, EntityId, EntityKind, EntityRecord, Operation, OperationKind, OperationStatus, Payload,
    References,
};
use crate::storage::{KvStore, ACTIVE_QUEUE_KEY, DEAD_LETTER_KEY, ID_MAP_KEY};

/// Result of queueing a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Queue operation id.
    pub operation_id: String,
    /// Entity the operation targets (the minted temporary id for creates).
    pub target: EntityId,
    /// True when an identical create was already queued and nothing changed.
    pub duplicate: bool,
}

struct EngineState {
    queue: QueueStore,
    dead_letters: DeadLetterStore,
    id_map: IdMap,
    mirror: EntityMirror,
}

/// What a successful dispatch returned.
enum Confirmed {
    Record(ServerRecord),
    Deleted,
}

/// What the flush loop should do with the head after pre-dispatch checks.
enum HeadCheck {
    Dispatch(Operation),
    /// Backing off or nothing queued.
    Stop,
    /// Dead-lettered before dispatch.
    DeadLettered(EntityKind),
}

/// Clears the single-flight flag when a flush ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine over a remote API `A`.
pub struct SyncEngine<A: RemoteApi> {
    api: A,
    store: Arc<dyn KvStore>,
    settings: EngineSettings,
    state: Mutex<EngineState>,
    flushing: AtomicBool,
    status_tx: watch::Sender<SyncStatus>,
    scope_tx: watch::Sender<InvalidationScope>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
    cancel: CancelToken,
}

impl<A: RemoteApi> std::fmt::Debug for SyncEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<A: RemoteApi> SyncEngine<A> {
    /// Rehydrate an engine from `store`.
    ///
    /// Queue entries already present in the dead-letter store are dropped
    /// (a crash can land between the two writes), known id mappings are
    /// applied to the queue, and the queued mutations are replayed into the
    /// mirror so pending entities are visible again.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read or decoded.
    pub fn open(api: A, store: Arc<dyn KvStore>, settings: EngineSettings) -> Result<Self> {
        let mut queue = QueueStore::load(store.clone(), settings.max_queue_depth)?;
        let dead_letters = DeadLetterStore::load(store.clone())?;
        let id_map = IdMap::load(store.as_ref())?;

        let dead_ids: HashSet<&str> = dead_letters
            .records()
            .iter()
            .map(|r| r.operation.id.as_str())
            .collect();
        let dropped = queue.drop_ids(&dead_ids);

        let mut resolved = 0;
        for op in queue.entries_mut() {
            resolved += resolve_payload(op.kind, &mut op.payload, &id_map);
        }

        if dropped > 0 || resolved > 0 {
            tracing::info!(dropped, resolved, "Repaired queue on open");
            queue.persist()?;
        }

        let mut mirror = EntityMirror::new();
        for op in queue.iter() {
            mirror.apply_local(op.kind.entity(), local_mutation(op));
        }

        let status = SyncStatus {
            pending: queue.len(),
            dead_lettered: dead_letters.len(),
            ..SyncStatus::default()
        };
        tracing::debug!(
            pending = status.pending,
            dead_lettered = status.dead_lettered,
            mapped = id_map.len(),
            "Sync engine opened"
        );

        Ok(Self {
            api,
            store,
            settings,
            state: Mutex::new(EngineState {
                queue,
                dead_letters,
                id_map,
                mirror,
            }),
            flushing: AtomicBool::new(false),
            status_tx: watch::channel(status).0,
            scope_tx: watch::channel(InvalidationScope::default()).0,
            invalidator: None,
            cancel: CancelToken::new(),
        })
    }

    /// Invalidate external read caches through `invalidator` after each batch.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create an entity optimistically. Returns its temporary id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] at the depth limit or a storage error if
    /// the operation could not be persisted; the mirror is untouched then.
    pub fn create(
        &self,
        kind: EntityKind,
        refs: References,
        fields: Map<String, Value>,
    ) -> Result<EntityId> {
        let op_kind = operation_kind(kind, Action::Create)?;
        let payload = Payload::new(EntityId::mint())
            .with_refs(refs)
            .with_fields(fields);
        Ok(self.enqueue(op_kind, payload)?.target)
    }

    /// Patch an entity optimistically. Returns the queue operation id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOperation`] for comments,
    /// [`Error::InvalidArgument`] for an empty patch,
    /// [`Error::EntityNotFound`] for a temporary id nothing local knows, and
    /// the enqueue errors of [`create`](Self::create).
    pub fn update(
        &self,
        kind: EntityKind,
        id: EntityId,
        refs: References,
        fields: Map<String, Value>,
    ) -> Result<String> {
        let op_kind = operation_kind(kind, Action::Update)?;
        if refs.is_empty() && fields.is_empty() {
            return Err(Error::InvalidArgument(format!("Empty patch for {kind} {id}")));
        }
        let payload = Payload::new(id).with_refs(refs).with_fields(fields);
        Ok(self.enqueue(op_kind, payload)?.operation_id)
    }

    /// Delete an entity optimistically. Returns the queue operation id.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub fn delete(&self, kind: EntityKind, id: EntityId) -> Result<String> {
        let op_kind = operation_kind(kind, Action::Delete)?;
        Ok(self.enqueue(op_kind, Payload::new(id))?.operation_id)
    }

    /// Queue an operation and apply it to the mirror.
    ///
    /// Temporary references the id map already resolves are rewritten first.
    /// The operation is persisted before the mirror changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a relationship field `kind`
    /// does not carry, [`Error::EntityNotFound`] when an update or delete
    /// targets an unknown temporary id, [`Error::QueueFull`], or a storage
    /// error.
    pub fn enqueue(&self, kind: OperationKind, mut payload: Payload) -> Result<Enqueued> {
        if let Some(relation) = undeclared_relations(kind, &payload.refs).first() {
            return Err(Error::InvalidArgument(format!(
                "{kind} does not accept {}",
                relation.wire_name()
            )));
        }

        let enqueued = {
            let mut state = self.lock();
            resolve_payload(kind, &mut payload, &state.id_map);
            let target = &payload.target;
            if !kind.is_create()
                && target.is_temporary()
                && state.queue.find_create(target).is_none()
                && state.mirror.get(kind.entity(), target).is_none()
            {
                return Err(Error::EntityNotFound {
                    kind: kind.entity(),
                    id: target.to_wire(),
                });
            }
            let op = Operation::new(kind, payload);

            match state.queue.append(op.clone())? {
                AppendOutcome::Duplicate { existing } => {
                    tracing::debug!(op_id = %existing, %kind, "Create already queued");
                    Enqueued {
                        operation_id: existing,
                        target: op.payload.target,
                        duplicate: true,
                    }
                }
                AppendOutcome::Appended => {
                    state.mirror.apply_local(kind.entity(), local_mutation(&op));
                    tracing::debug!(op_id = %op.id, %kind, target = %op.payload.target, "Queued operation");
                    Enqueued {
                        operation_id: op.id,
                        target: op.payload.target,
                        duplicate: false,
                    }
                }
            }
        };
        self.publish(None, None);
        Ok(enqueued)
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Drain up to `max_per_run` operations in FIFO order.
    ///
    /// Single-flight: a call made while another flush is running returns a
    /// `skipped` report immediately. Per-operation failures never escape;
    /// they are retried with backoff or dead-lettered, and the report
    /// summarizes the run.
    pub async fn attempt_flush(&self) -> FlushReport {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Flush already running; skipping");
            return FlushReport::skipped(self.pending_count());
        }
        let _guard = FlightGuard(&self.flushing);

        self.publish(Some(SyncPhase::Syncing), None);
        let mut report = FlushReport::default();
        let mut touched: BTreeSet<EntityKind> = BTreeSet::new();
        let mut processed = 0;

        while processed < self.settings.max_per_run {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let op = match self.check_head() {
                HeadCheck::Dispatch(op) => op,
                HeadCheck::Stop => break,
                HeadCheck::DeadLettered(kind) => {
                    processed += 1;
                    report.dead_lettered += 1;
                    touched.insert(kind);
                    continue;
                }
            };

            processed += 1;
            report.dispatched += 1;
            tracing::debug!(op_id = %op.id, kind = %op.kind, retry_count = op.retry_count, "Dispatching");

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(ApiError::Cancelled),
                result = self.dispatch(&op) => result,
            };

            match result {
                Ok(confirmed) => {
                    if self.apply_success(&op, confirmed) {
                        report.succeeded += 1;
                        touched.insert(op.kind.entity());
                    } else {
                        break;
                    }
                }
                Err(ApiError::Cancelled) => {
                    tracing::info!(op_id = %op.id, "Flush cancelled; operation stays queued");
                    report.cancelled = true;
                    break;
                }
                Err(err) => match self.settings.retry.decide(&err, op.retry_count) {
                    FailureAction::Retry { retry_count, delay } => {
                        self.schedule_retry(&op, retry_count, delay, &err);
                        report.retried += 1;
                        break;
                    }
                    FailureAction::DeadLetter(reason) => {
                        self.dead_letter_head(&op.id, reason, err.to_string());
                        report.dead_lettered += 1;
                        touched.insert(op.kind.entity());
                    }
                },
            }
        }

        report.remaining = self.pending_count();
        if !report.cancelled {
            self.invalidate(&touched);
        }
        tracing::info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Flush finished"
        );
        self.publish(None, Some(report.clone()));
        report
    }

    /// Resolve the head's references and decide whether it can be sent.
    fn check_head(&self) -> HeadCheck {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(head) = state.queue.front_mut() else {
            return HeadCheck::Stop;
        };
        if !head.is_due(now_ms()) {
            tracing::debug!(op_id = %head.id, "Head is backing off");
            return HeadCheck::Stop;
        }

        if resolve_payload(head.kind, &mut head.payload, &state.id_map) > 0 {
            if let Err(e) = state.queue.persist() {
                tracing::error!(error = %e, "Failed to persist resolved references");
            }
        }

        let Some(head) = state.queue.peek_front() else {
            return HeadCheck::Stop;
        };
        let missing = unresolved(head.kind, &head.payload);
        if missing.is_empty() {
            return HeadCheck::Dispatch(head.clone());
        }

        let kind = head.kind.entity();
        let op_id = head.id.clone();
        let (field, target_kind, id) = &missing[0];
        let queued_behind = state.queue.find_create(id).is_some();
        let message = if queued_behind {
            format!(
                "{} references {target_kind} {id} whose create is queued behind it",
                field.wire_name()
            )
        } else {
            format!("{} references {target_kind} {id} which was never created", field.wire_name())
        };
        tracing::warn!(%op_id, %message, "Unresolved reference");
        self.dead_letter_locked(state, &op_id, DeadLetterReason::UnresolvedReference, message);
        HeadCheck::DeadLettered(kind)
    }

    async fn dispatch(&self, op: &Operation) -> std::result::Result<Confirmed, ApiError> {
        let entity = op.kind.entity();
        let payload = &op.payload;
        match op.kind.action() {
            Action::Create => {
                let request = CreateRequest {
                    client_id: payload.target.to_wire(),
                    refs: WireRefs::from(&payload.refs),
                    fields: payload.fields.clone(),
                };
                self.api.create(entity, &request).await.map(Confirmed::Record)
            }
            Action::Update => {
                let id = canonical_target(op)?;
                let request = UpdateRequest {
                    refs: WireRefs::from(&payload.refs),
                    fields: payload.fields.clone(),
                };
                self.api.update(entity, id, &request).await.map(Confirmed::Record)
            }
            Action::Delete => {
                let id = canonical_target(op)?;
                self.api.delete(entity, id).await.map(|()| Confirmed::Deleted)
            }
        }
    }

    /// Apply a confirmed dispatch. Returns `false` if the head changed
    /// underneath the flush (nothing is applied then).
    fn apply_success(&self, op: &Operation, confirmed: Confirmed) -> bool {
        let mut state = self.lock();
        let state = &mut *state;
        if state.queue.peek_front().map(|head| head.id.as_str()) != Some(op.id.as_str()) {
            tracing::warn!(op_id = %op.id, "Queue head changed during dispatch");
            return false;
        }
        state.queue.take_front();

        let entity = op.kind.entity();
        let mut keys = vec![ACTIVE_QUEUE_KEY];
        match (op.kind.action(), confirmed) {
            (Action::Create, Confirmed::Record(record)) => {
                let temp = &op.payload.target;
                let canonical = EntityId::canonical(record.id.clone());
                if state.id_map.insert(temp, &record.id) {
                    keys.push(ID_MAP_KEY);
                }
                let rewritten =
                    reconcile_queue(state.queue.entries_mut(), entity, temp, &canonical);
                let outcome = state
                    .mirror
                    .merge_server_result(entity, Some(temp), record.into_entity());
                // A counterpart found by id or signature may not be `temp`;
                // references to `temp` itself still need the canonical id.
                let rewrote_temp = outcome.id_change(&canonical).map(|(old, new)| {
                    state.mirror.rewrite_references(old, new);
                    old == temp
                });
                if rewrote_temp != Some(true) {
                    state.mirror.rewrite_references(temp, &canonical);
                }
                replay_queued(state, entity, &canonical);
                tracing::info!(
                    op_id = %op.id,
                    kind = %op.kind,
                    temp = %temp,
                    canonical = %canonical,
                    rewritten,
                    "Create confirmed"
                );
            }
            (_, Confirmed::Record(record)) => {
                let id = EntityId::canonical(record.id.clone());
                state.mirror.merge_server_result(entity, None, record.into_entity());
                replay_queued(state, entity, &id);
                tracing::debug!(op_id = %op.id, kind = %op.kind, "Update confirmed");
            }
            (_, Confirmed::Deleted) => {
                state.mirror.remove(entity, &op.payload.target);
                tracing::debug!(op_id = %op.id, kind = %op.kind, "Delete confirmed");
            }
        }

        self.persist_locked(state, &keys);
        true
    }

    fn schedule_retry(&self, op: &Operation, retry_count: u32, delay: std::time::Duration, err: &ApiError) {
        let mut state = self.lock();
        let Some(head) = state.queue.front_mut().filter(|head| head.id == op.id) else {
            return;
        };
        head.retry_count = retry_count;
        head.last_error = Some(err.to_string());
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        head.next_attempt_at = Some(now_ms().saturating_add(delay_ms));
        tracing::warn!(
            op_id = %op.id,
            kind = %op.kind,
            retry_count,
            delay_ms,
            error = %err,
            "Recoverable failure; will retry"
        );
        if let Err(e) = state.queue.persist() {
            tracing::error!(error = %e, "Failed to persist retry state");
        }
    }

    fn dead_letter_head(&self, op_id: &str, reason: DeadLetterReason, error: String) {
        let mut state = self.lock();
        self.dead_letter_locked(&mut state, op_id, reason, error);
    }

    /// Move the head to the dead-letter store. The dead-letter list is
    /// written before the queue so a crash in between only leaves a
    /// duplicate that [`open`](Self::open) drops.
    fn dead_letter_locked(
        &self,
        state: &mut EngineState,
        op_id: &str,
        reason: DeadLetterReason,
        error: String,
    ) {
        if state.queue.peek_front().map(|head| head.id.as_str()) != Some(op_id) {
            return;
        }
        let Some(op) = state.queue.take_front() else {
            return;
        };
        tracing::warn!(
            op_id = %op.id,
            kind = %op.kind,
            retry_count = op.retry_count,
            %reason,
            %error,
            "Dead-lettering operation"
        );
        if op.kind.is_create() {
            state.mirror.remove(op.kind.entity(), &op.payload.target);
        }
        state
            .dead_letters
            .push(DeadLetterRecord::new(op, error, reason));
        self.persist_locked(state, &[DEAD_LETTER_KEY, ACTIVE_QUEUE_KEY]);
    }

    fn persist_locked(&self, state: &EngineState, keys: &[&'static str]) {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let encoded = match *key {
                ID_MAP_KEY => state.id_map.encoded(),
                DEAD_LETTER_KEY => state.dead_letters.encoded(),
                _ => state.queue.encoded(),
            };
            match encoded {
                Ok(value) => entries.push((*key, value)),
                Err(e) => {
                    tracing::error!(key, error = %e, "Failed to encode sync state");
                    return;
                }
            }
        }
        if let Err(e) = self.store.put_many(&entries) {
            tracing::error!(error = %e, "Failed to persist sync state");
        }
    }

    fn invalidate(&self, touched: &BTreeSet<EntityKind>) {
        let Some(invalidator) = &self.invalidator else {
            return;
        };
        let scope = self.scope_tx.borrow().clone();
        for kind in touched {
            invalidator.invalidate(ReadView::from(*kind), &scope);
        }
    }

    // ------------------------------------------------------------------
    // Status and control
    // ------------------------------------------------------------------

    /// Push a fresh [`SyncStatus`]. A flush report settles the phase to
    /// synced or pending; other updates only move an idle/synced engine to
    /// pending when work arrives.
    fn publish(&self, phase: Option<SyncPhase>, report: Option<FlushReport>) {
        let (pending, dead_lettered) = {
            let state = self.lock();
            (state.queue.len(), state.dead_letters.len())
        };
        self.status_tx.send_modify(|status| {
            status.pending = pending;
            status.dead_lettered = dead_lettered;
            match (phase, report) {
                (_, Some(report)) => {
                    status.phase = if pending == 0 {
                        SyncPhase::Synced
                    } else {
                        SyncPhase::Pending
                    };
                    status.last_flush_at = Some(now_ms());
                    status.last_report = Some(report);
                }
                (Some(phase), None) => status.phase = phase,
                (None, None) => {
                    if pending > 0 && status.phase != SyncPhase::Syncing {
                        status.phase = SyncPhase::Pending;
                    }
                }
            }
        });
    }

    /// Watch channel of [`SyncStatus`] snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Set the workspace/project whose read caches are invalidated.
    pub fn set_active_scope(&self, scope: InvalidationScope) {
        self.scope_tx.send_replace(scope);
    }

    /// Follows [`set_active_scope`](Self::set_active_scope), for the realtime listener.
    #[must_use]
    pub fn scope_receiver(&self) -> watch::Receiver<InvalidationScope> {
        self.scope_tx.subscribe()
    }

    /// Token that stops in-flight and future flushes when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel any in-flight dispatch and stop further flushes.
    pub fn shutdown(&self) {
        tracing::debug!("Sync engine shutting down");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Ordered copy of the queue.
    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<Operation> {
        self.lock().queue.snapshot()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock().dead_letters.records().to_vec()
    }

    /// Canonical id for a temporary one, if its create has been confirmed.
    #[must_use]
    pub fn resolve_id(&self, id: &EntityId) -> Option<EntityId> {
        self.lock().id_map.resolve(id)
    }

    #[must_use]
    pub fn mapped_id_count(&self) -> usize {
        self.lock().id_map.len()
    }

    /// Records of `kind` as the UI should show them.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> Vec<EntityRecord> {
        self.lock().mirror.list(kind).to_vec()
    }

    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<EntityRecord> {
        self.lock().mirror.get(kind, id).cloned()
    }

    /// Merge an independently fetched server snapshot into the mirror.
    ///
    /// Records paired with an optimistic one by content signature reconcile
    /// the temporary id like a confirmed create would.
    pub fn apply_snapshot(&self, kind: EntityKind, records: Vec<ServerRecord>) {
        let mut state = self.lock();
        let state = &mut *state;
        let records: Vec<EntityRecord> = records.into_iter().map(ServerRecord::into_entity).collect();
        let ids: Vec<EntityId> = records.iter().map(|r| r.id.clone()).collect();
        let changes = state.mirror.apply_snapshot(kind, records);

        let mut keys = Vec::new();
        for (old, new) in changes {
            state.mirror.rewrite_references(&old, &new);
            let Some(canonical) = new.as_canonical() else {
                continue;
            };
            if state.id_map.insert(&old, canonical) {
                keys.push(ID_MAP_KEY);
            }
            if reconcile_queue(state.queue.entries_mut(), kind, &old, &new) > 0 {
                keys.push(ACTIVE_QUEUE_KEY);
            }
        }
        for id in &ids {
            replay_queued(state, kind, id);
        }
        keys.sort_unstable();
        keys.dedup();
        if !keys.is_empty() {
            self.persist_locked(state, &keys);
        }
    }

    // ------------------------------------------------------------------
    // Dead-letter administration
    // ------------------------------------------------------------------

    /// Move a dead-lettered operation back to the end of the queue with a
    /// fresh retry budget.
    ///
    /// The queue is written before the dead-letter list, so a crash in
    /// between leaves the operation dead-lettered rather than lost.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationNotFound`], [`Error::QueueFull`], or a
    /// storage error.
    pub fn requeue_dead_letter(&self, op_id: &str) -> Result<Operation> {
        let op = {
            let mut state = self.lock();
            let state = &mut *state;
            let record = state
                .dead_letters
                .records()
                .iter()
                .find(|r| r.operation.id == op_id)
                .cloned()
                .ok_or_else(|| Error::OperationNotFound {
                    id: op_id.to_string(),
                })?;

            let mut op = record.operation;
            op.retry_count = 0;
            op.status = OperationStatus::Pending;
            op.last_error = None;
            op.next_attempt_at = None;
            resolve_payload(op.kind, &mut op.payload, &state.id_map);

            if let AppendOutcome::Duplicate { existing } = state.queue.append(op.clone())? {
                tracing::debug!(op_id, %existing, "Requeued create already pending");
            } else {
                state.mirror.apply_local(op.kind.entity(), local_mutation(&op));
            }
            state.dead_letters.take(op_id)?;
            tracing::info!(op_id, kind = %op.kind, "Requeued dead-lettered operation");
            op
        };
        self.publish(None, None);
        Ok(op)
    }

    /// Drop every dead-letter record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the cleared list cannot be persisted.
    pub fn clear_dead_letters(&self) -> Result<usize> {
        let cleared = self.lock().dead_letters.clear()?;
        self.publish(None, None);
        Ok(cleared)
    }
}

fn operation_kind(kind: EntityKind, action: Action) -> Result<OperationKind> {
    OperationKind::for_action(kind, action).ok_or_else(|| Error::UnsupportedOperation {
        kind,
        action: action.to_string(),
    })
}

fn canonical_target(op: &Operation) -> std::result::Result<&str, ApiError> {
    op.payload
        .target
        .as_canonical()
        .ok_or_else(|| ApiError::NotFound {
            kind: op.kind.entity(),
            id: op.payload.target.to_wire(),
        })
}

/// Re-apply the queued changes to `id` on top of a server record that just
/// replaced it, so the mirror keeps showing them until they are confirmed.
fn replay_queued(state: &mut EngineState, kind: EntityKind, id: &EntityId) -> usize {
    let mutations: Vec<LocalMutation> = state
        .queue
        .iter()
        .filter(|op| op.kind.entity() == kind && &op.payload.target == id)
        .map(local_mutation)
        .collect();
    let replayed = mutations.len();
    for mutation in mutations {
        state.mirror.apply_local(kind, mutation);
    }
    if replayed > 0 {
        tracing::debug!(%kind, id = %id, replayed, "Replayed queued changes over server record");
    }
    replayed
}

fn local_mutation(op: &Operation) -> LocalMutation {
    let payload = op.payload.clone();
    match op.kind.action() {
        Action::Create => LocalMutation::Create {
            id: payload.target,
            refs: payload.refs,
            fields: payload.fields,
        },
        Action::Update => LocalMutation::Update {
            id: payload.target,
            refs: payload.refs,
            fields: payload.fields,
        },
        Action::Delete => LocalMutation::Delete { id: payload.target },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use crate::sync::classify::RetryPolicy;
    use crate::sync::realtime::tests::RecordingInvalidator;
    use crate::sync::test_support::FakeApi;
    use serde_json::json;
    use std::time::Duration;

    type TestEngine = SyncEngine<Arc<FakeApi>>;

    fn settings() -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy {
                limit: 4,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            ..EngineSettings::default()
        }
    }

    fn engine_on(api: &Arc<FakeApi>, store: &Arc<MemoryKvStore>, settings: EngineSettings) -> TestEngine {
        SyncEngine::open(api.clone(), store.clone(), settings).unwrap()
    }

    fn engine() -> (TestEngine, Arc<FakeApi>, Arc<MemoryKvStore>) {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        (engine_on(&api, &store, settings()), api, store)
    }

    fn fields(key: &str, value: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(key.into(), json!(value));
        fields
    }

    fn in_project(project: &EntityId) -> References {
        References {
            project_id: Some(project.clone()),
            ..References::default()
        }
    }

    fn http(status: u16, message: &str) -> ApiError {
        ApiError::Http {
            status,
            message: message.into(),
        }
    }

    #[test]
    fn test_create_is_optimistic_and_durable() {
        let (engine, _api, store) = engine();
        let id = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();

        assert!(id.is_temporary());
        let record = engine.get(EntityKind::Task, &id).unwrap();
        assert!(record.pending);
        assert_eq!(engine.pending_count(), 1);
        assert!(store.dump().contains_key(ACTIVE_QUEUE_KEY));
    }

    #[tokio::test]
    async fn test_flush_confirms_create() {
        let (engine, _api, _store) = engine();
        let tmp = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 0);

        let canonical = engine.resolve_id(&tmp).unwrap();
        assert_eq!(canonical, EntityId::canonical("srv_1"));
        let projects = engine.list(EntityKind::Project);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, canonical);
        assert!(!projects[0].pending);
        assert_eq!(engine.status().phase, SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_dependents_are_rewritten_before_dispatch() {
        let (engine, api, _store) = engine();
        let project = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        let task = engine
            .create(EntityKind::Task, in_project(&project), fields("title", "Draft"))
            .unwrap();
        engine
            .update(EntityKind::Task, task.clone(), References::default(), fields("status", "done"))
            .unwrap();
        engine
            .create(
                EntityKind::Comment,
                References {
                    task_id: Some(task),
                    ..References::default()
                },
                fields("body", "Looks good"),
            )
            .unwrap();

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 4, "{report:?}");

        let calls = api.calls();
        assert_eq!(calls[0].kind, EntityKind::Project);
        assert_eq!(calls[1].body["projectId"], "srv_1");
        assert_eq!((calls[2].action, calls[2].id.as_str()), (Action::Update, "srv_2"));
        assert_eq!(calls[3].body["taskId"], "srv_2");

        let tasks = engine.list(EntityKind::Task);
        assert_eq!(tasks[0].refs.project_id, Some(EntityId::canonical("srv_1")));
        assert_eq!(tasks[0].text("status"), Some("done"));
    }

    #[tokio::test]
    async fn test_mapping_applies_to_later_enqueues() {
        let (engine, _api, _store) = engine();
        let project = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        engine.attempt_flush().await;

        engine
            .create(EntityKind::Task, in_project(&project), fields("title", "Late"))
            .unwrap();
        let queued = engine.queue_snapshot();
        assert_eq!(
            queued[0].payload.refs.project_id,
            Some(EntityId::canonical("srv_1"))
        );
    }

    fn capped_engine() -> (TestEngine, Arc<FakeApi>) {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(
            &api,
            &store,
            EngineSettings {
                max_per_run: 1,
                ..settings()
            },
        );
        (engine, api)
    }

    #[tokio::test]
    async fn test_confirmed_create_keeps_queued_patch() {
        let (engine, api) = capped_engine();
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        engine
            .update(EntityKind::Task, tmp.clone(), References::default(), fields("status", "done"))
            .unwrap();

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(engine.pending_count(), 1);
        let canonical = EntityId::canonical("srv_1");
        let task = engine.get(EntityKind::Task, &canonical).unwrap();
        assert_eq!(task.text("title"), Some("Draft"));
        assert_eq!(task.text("status"), Some("done"));
        assert!(task.pending);
        assert!(engine.get(EntityKind::Task, &tmp).is_none());

        // A failed attempt at the update leaves the optimistic view alone.
        api.script([http(500, "unavailable")]);
        let report = engine.attempt_flush().await;
        assert_eq!(report.retried, 1);
        let task = engine.get(EntityKind::Task, &canonical).unwrap();
        assert_eq!(task.text("status"), Some("done"));
        assert!(task.pending);

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 1);
        let task = engine.get(EntityKind::Task, &canonical).unwrap();
        assert_eq!(task.text("status"), Some("done"));
        assert!(!task.pending);
    }

    #[tokio::test]
    async fn test_confirmed_update_keeps_later_patch() {
        let (engine, _api) = capped_engine();
        let tmp = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        engine.attempt_flush().await;
        let canonical = engine.resolve_id(&tmp).unwrap();

        engine
            .update(EntityKind::Project, canonical.clone(), References::default(), fields("status", "active"))
            .unwrap();
        engine
            .update(EntityKind::Project, canonical.clone(), References::default(), fields("name", "Beta"))
            .unwrap();
        engine.attempt_flush().await;

        let project = engine.get(EntityKind::Project, &canonical).unwrap();
        assert_eq!(project.text("status"), Some("active"));
        assert_eq!(project.text("name"), Some("Beta"));
        assert!(project.pending);
    }

    #[tokio::test]
    async fn test_confirmed_create_then_queued_delete_stays_hidden() {
        let (engine, _api) = capped_engine();
        let tmp = engine
            .create(EntityKind::TeamMember, References::default(), fields("email", "ada@x.io"))
            .unwrap();
        engine.delete(EntityKind::TeamMember, tmp).unwrap();

        engine.attempt_flush().await;
        assert!(engine.list(EntityKind::TeamMember).is_empty());
        assert_eq!(engine.pending_count(), 1);
        let queued = engine.queue_snapshot();
        assert_eq!(queued[0].payload.target, EntityId::canonical("srv_1"));
    }

    #[tokio::test]
    async fn test_dependent_create_is_rewritten_between_runs() {
        let (engine, api) = capped_engine();
        let project = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        let task = engine
            .create(EntityKind::Task, in_project(&project), fields("title", "Draft"))
            .unwrap();

        engine.attempt_flush().await;
        let canonical = EntityId::canonical("srv_1");
        let queued = engine.queue_snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload.refs.project_id, Some(canonical.clone()));
        assert_eq!(queued[0].payload.target, task);
        let record = engine.get(EntityKind::Task, &task).unwrap();
        assert_eq!(record.refs.project_id, Some(canonical.clone()));
        assert!(record.pending);

        engine.attempt_flush().await;
        assert_eq!(api.calls()[1].body["projectId"], "srv_1");
    }

    #[test]
    fn test_undeclared_reference_is_rejected() {
        let (engine, _api, _store) = engine();
        let project = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();

        let err = engine
            .create(EntityKind::TeamMember, in_project(&project), fields("email", "ada@x.io"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");

        let assigned = References {
            assignee_id: Some(EntityId::canonical("m1")),
            ..References::default()
        };
        let err = engine
            .create(EntityKind::Project, assigned, fields("name", "Beta"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");

        assert_eq!(engine.pending_count(), 1);
        assert!(engine.list(EntityKind::TeamMember).is_empty());
        assert_eq!(engine.list(EntityKind::Project).len(), 1);
    }

    #[test]
    fn test_unknown_temporary_target_is_not_found() {
        let (engine, _api, _store) = engine();
        let err = engine
            .update(EntityKind::Task, EntityId::mint(), References::default(), fields("status", "done"))
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { kind: EntityKind::Task, .. }), "{err}");
        assert!(matches!(
            engine.delete(EntityKind::Project, EntityId::mint()),
            Err(Error::EntityNotFound { .. })
        ));
        assert_eq!(engine.pending_count(), 0);

        // Known locally, or already queued for creation: accepted.
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        engine.delete(EntityKind::Task, tmp.clone()).unwrap();
        engine
            .update(EntityKind::Task, tmp, References::default(), fields("status", "done"))
            .unwrap();
    }

    #[test]
    fn test_same_client_id_is_queued_once() {
        let (engine, _api, _store) = engine();
        let payload = Payload::new(EntityId::mint()).with_fields(fields("name", "Alpha"));
        let first = engine.enqueue(OperationKind::CreateProject, payload.clone()).unwrap();
        let second = engine.enqueue(OperationKind::CreateProject, payload).unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.operation_id, first.operation_id);
        assert_eq!(engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_replayed_create_does_not_duplicate_server_side() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(&api, &store, settings());
        engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        let before_flush = store.dump();
        engine.attempt_flush().await;

        // Restart from state captured before the success was recorded.
        let replay_store = Arc::new(MemoryKvStore::from_entries(before_flush));
        let replay = engine_on(&api, &replay_store, settings());
        assert_eq!(replay.pending_count(), 1);
        let report = replay.attempt_flush().await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(api.call_count(), 2);
        assert_eq!(api.records(EntityKind::Project).len(), 1);
        assert_eq!(
            replay.list(EntityKind::Project)[0].id,
            EntityId::canonical("srv_1")
        );
    }

    #[tokio::test]
    async fn test_single_flight() {
        let api = Arc::new(FakeApi::gated());
        let store = Arc::new(MemoryKvStore::new());
        let engine = Arc::new(engine_on(&api, &store, settings()));
        engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.attempt_flush().await })
        };
        api.wait_started(1).await;
        assert!(engine.is_flushing());

        let second = engine.attempt_flush().await;
        assert!(second.skipped);
        assert_eq!(second.dispatched, 0);

        api.release(1);
        let first = first.await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(api.call_count(), 1);
        assert!(!engine.is_flushing());
    }

    #[tokio::test]
    async fn test_recoverable_failures_are_bounded() {
        let (engine, api, _store) = engine();
        api.fail_always(Some(ApiError::Network("connection refused".into())));
        engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();

        for _ in 0..10 {
            engine.attempt_flush().await;
        }

        let limit = engine.settings().retry.limit as usize;
        assert_eq!(api.call_count(), limit + 1);
        assert_eq!(engine.pending_count(), 0);
        let dead = engine.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::RetryExhausted);
        assert_eq!(dead[0].retry_count, 4);
        assert!(engine.list(EntityKind::Task).is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_goes_straight_to_dead_letter() {
        let (engine, api, _store) = engine();
        api.fail_always(Some(http(400, "title is required")));
        let tmp = engine
            .create(EntityKind::Task, References::default(), Map::new())
            .unwrap();

        let report = engine.attempt_flush().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(api.call_count(), 1);

        let dead = engine.dead_letters();
        assert_eq!(dead[0].retry_count, 0);
        assert_eq!(dead[0].reason, DeadLetterReason::Unrecoverable);
        assert_eq!(dead[0].operation.status, OperationStatus::Dead);
        assert!(engine.get(EntityKind::Task, &tmp).is_none());
    }

    #[tokio::test]
    async fn test_recoverable_failure_halts_batch() {
        let (engine, api, _store) = engine();
        for name in ["a", "b", "c"] {
            engine
                .create(EntityKind::Project, References::default(), fields("name", name))
                .unwrap();
        }
        api.script([ApiError::Timeout]);

        let report = engine.attempt_flush().await;
        assert_eq!((report.dispatched, report.retried, report.remaining), (1, 1, 3));
        assert_eq!(api.call_count(), 1);
        let head = &engine.queue_snapshot()[0];
        assert_eq!(head.retry_count, 1);
        assert!(head.last_error.is_some());

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_continues_batch() {
        let (engine, api, _store) = engine();
        for name in ["a", "b"] {
            engine
                .create(EntityKind::Project, References::default(), fields("name", name))
                .unwrap();
        }
        api.script([http(422, "duplicate name")]);

        let report = engine.attempt_flush().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_backing_off_head_is_not_dispatched() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(&api, &store, EngineSettings::default());
        engine
            .create(EntityKind::Project, References::default(), fields("name", "a"))
            .unwrap();
        api.script([ApiError::Timeout]);

        engine.attempt_flush().await;
        let report = engine.attempt_flush().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(api.call_count(), 1);
        assert!(engine.queue_snapshot()[0].next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_run_is_capped() {
        let (engine, _api, _store) = engine();
        for i in 0..8 {
            engine
                .create(EntityKind::TeamMember, References::default(), fields("email", &format!("m{i}@x.io")))
                .unwrap();
        }
        let report = engine.attempt_flush().await;
        assert_eq!(report.dispatched, engine.settings().max_per_run);
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_is_dead_lettered_without_dispatch() {
        let (engine, api, _store) = engine();
        let unknown_member = References {
            assignee_id: Some(EntityId::mint()),
            ..References::default()
        };
        engine
            .create(EntityKind::Task, unknown_member, fields("title", "Draft"))
            .unwrap();

        let report = engine.attempt_flush().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(api.call_count(), 0);
        assert_eq!(
            engine.dead_letters()[0].reason,
            DeadLetterReason::UnresolvedReference
        );
    }

    #[test]
    fn test_queue_survives_restart() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(&api, &store, settings());
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        engine.delete(EntityKind::Project, EntityId::canonical("p9")).unwrap();
        let before: Vec<String> = engine.queue_snapshot().into_iter().map(|op| op.id).collect();
        drop(engine);

        let restarted = engine_on(&api, &store, settings());
        let after: Vec<String> = restarted.queue_snapshot().into_iter().map(|op| op.id).collect();
        assert_eq!(before, after);
        assert!(restarted.get(EntityKind::Task, &tmp).unwrap().pending);
        assert_eq!(restarted.status().pending, 2);
    }

    #[tokio::test]
    async fn test_crash_between_dead_letter_writes_is_deduped() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(&api, &store, settings());
        engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        let queue_before = store.dump();

        api.fail_always(Some(http(400, "bad")));
        engine.attempt_flush().await;

        // Dead-letter written, queue write lost.
        let mut entries = store.dump();
        entries.insert(
            ACTIVE_QUEUE_KEY.to_string(),
            queue_before[ACTIVE_QUEUE_KEY].clone(),
        );
        let crashed = Arc::new(MemoryKvStore::from_entries(entries));
        let reopened = engine_on(&api, &crashed, settings());
        assert_eq!(reopened.pending_count(), 0);
        assert_eq!(reopened.dead_letters().len(), 1);
    }

    #[test]
    fn test_full_queue_rejects_without_optimistic_change() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let engine = engine_on(
            &api,
            &store,
            EngineSettings {
                max_queue_depth: 2,
                ..settings()
            },
        );
        for name in ["a", "b"] {
            engine
                .create(EntityKind::Project, References::default(), fields("name", name))
                .unwrap();
        }
        let err = engine
            .create(EntityKind::Project, References::default(), fields("name", "c"))
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { depth: 2, limit: 2 }));
        assert_eq!(engine.list(EntityKind::Project).len(), 2);
    }

    #[test]
    fn test_failed_persist_leaves_mirror_untouched() {
        let (engine, _api, store) = engine();
        store.set_fail_writes(true);
        assert!(engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .is_err());
        assert!(engine.list(EntityKind::Task).is_empty());
    }

    #[test]
    fn test_comments_cannot_be_updated() {
        let (engine, _api, _store) = engine();
        let err = engine
            .update(EntityKind::Comment, EntityId::canonical("c1"), References::default(), fields("body", "x"))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert!(matches!(
            engine.update(EntityKind::Task, EntityId::canonical("t1"), References::default(), Map::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_leaves_operation_queued() {
        let api = Arc::new(FakeApi::gated());
        let store = Arc::new(MemoryKvStore::new());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let engine = Arc::new(
            engine_on(&api, &store, settings()).with_invalidator(invalidator.clone()),
        );
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();

        let flush = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.attempt_flush().await })
        };
        api.wait_started(1).await;
        engine.shutdown();

        let report = flush.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        let queued = engine.queue_snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 0);
        assert!(engine.get(EntityKind::Task, &tmp).unwrap().pending);
        assert!(invalidator.views().is_empty());

        let after = engine.attempt_flush().await;
        assert!(after.cancelled);
        assert_eq!(after.dispatched, 0);
    }

    #[tokio::test]
    async fn test_batch_invalidates_touched_views_in_scope() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryKvStore::new());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let engine = engine_on(&api, &store, settings()).with_invalidator(invalidator.clone());
        engine.set_active_scope(InvalidationScope {
            workspace_id: Some("w1".into()),
            project_id: None,
        });
        engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();

        engine.attempt_flush().await;
        let mut views = invalidator.views();
        views.sort_by_key(ToString::to_string);
        assert_eq!(views, vec![ReadView::Projects, ReadView::Tasks]);
        let calls = invalidator.calls.lock().unwrap();
        assert_eq!(calls[0].1.workspace_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let (engine, api, _store) = engine();
        api.fail_always(Some(http(400, "bad")));
        let tmp = engine
            .create(EntityKind::Project, References::default(), fields("name", "Alpha"))
            .unwrap();
        engine.attempt_flush().await;
        let op_id = engine.dead_letters()[0].operation.id.clone();

        api.fail_always(None);
        let requeued = engine.requeue_dead_letter(&op_id).unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert!(engine.dead_letters().is_empty());
        assert!(engine.get(EntityKind::Project, &tmp).is_some());

        let report = engine.attempt_flush().await;
        assert_eq!(report.succeeded, 1);
        assert!(matches!(
            engine.requeue_dead_letter("op_missing"),
            Err(Error::OperationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_subscription() {
        let (engine, _api, _store) = engine();
        let rx = engine.subscribe();
        assert_eq!(rx.borrow().phase, SyncPhase::Idle);

        engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        assert_eq!(rx.borrow().phase, SyncPhase::Pending);
        assert_eq!(rx.borrow().pending, 1);

        engine.attempt_flush().await;
        let status = rx.borrow().clone();
        assert_eq!(status.phase, SyncPhase::Synced);
        assert_eq!(status.pending, 0);
        assert!(status.last_flush_at.is_some());
        assert_eq!(status.last_report.unwrap().succeeded, 1);
    }

    #[test]
    fn test_snapshot_pairs_optimistic_record_by_signature() {
        let (engine, _api, _store) = engine();
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Write Report"))
            .unwrap();
        engine
            .update(EntityKind::Task, tmp.clone(), References::default(), fields("status", "done"))
            .unwrap();

        let server: ServerRecord = serde_json::from_value(json!({
            "id": "t9",
            "title": "write report"
        }))
        .unwrap();
        engine.apply_snapshot(EntityKind::Task, vec![server]);

        assert_eq!(engine.resolve_id(&tmp), Some(EntityId::canonical("t9")));
        assert_eq!(engine.list(EntityKind::Task).len(), 1);
        let queued = engine.queue_snapshot();
        // The create keeps its client id; the update now targets t9.
        assert_eq!(queued[0].payload.target, tmp);
        assert_eq!(queued[1].payload.target, EntityId::canonical("t9"));
        let task = engine.get(EntityKind::Task, &EntityId::canonical("t9")).unwrap();
        assert_eq!(task.text("status"), Some("done"));
        assert!(task.pending);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_queued_patch_on_confirmed_record() {
        let (engine, _api, _store) = engine();
        let tmp = engine
            .create(EntityKind::Task, References::default(), fields("title", "Draft"))
            .unwrap();
        engine.attempt_flush().await;
        let canonical = engine.resolve_id(&tmp).unwrap();
        engine
            .update(EntityKind::Task, canonical.clone(), References::default(), fields("status", "done"))
            .unwrap();

        let server: ServerRecord = serde_json::from_value(json!({
            "id": "srv_1",
            "title": "Draft",
            "status": "todo"
        }))
        .unwrap();
        engine.apply_snapshot(EntityKind::Task, vec![server]);

        let task = engine.get(EntityKind::Task, &canonical).unwrap();
        assert_eq!(task.text("status"), Some("done"));
        assert!(task.pending);
    }
}
