//! In-memory [`RemoteApi`] for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};

use super::api::{ApiError, CreateRequest, RemoteApi, ServerRecord, UpdateRequest, WireRefs};
use crate::model::{Action, EntityKind, TEMP_PREFIX};

/// One call the fake received.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FakeCall {
    pub action: Action,
    pub kind: EntityKind,
    /// Client id for creates, entity id otherwise.
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: usize,
    by_client: HashMap<String, ServerRecord>,
    records: HashMap<(EntityKind, String), ServerRecord>,
    scripted: VecDeque<ApiError>,
    always: Option<ApiError>,
    calls: Vec<FakeCall>,
}

/// Server double: `clientId`-idempotent creates, canonical ids `srv_N`,
/// scripted failures, and an optional gate that holds every call until
/// the test releases it.
#[derive(Debug, Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeState>,
    gate: Option<Arc<Semaphore>>,
    started: AtomicUsize,
    call_started: Notify,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Calls block until [`release`](Self::release) hands out permits.
    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub(crate) fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Wait until at least `n` calls have started.
    pub(crate) async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.call_started.notified();
            if self.started.load(Ordering::SeqCst) >= n {
                return;
            }
            notified.await;
        }
    }

    /// Fail the next calls, in order, with these errors.
    pub(crate) fn script(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.state.lock().unwrap().scripted.extend(errors);
    }

    /// Fail every call with `error` (or stop failing with `None`).
    pub(crate) fn fail_always(&self, error: Option<ApiError>) {
        self.state.lock().unwrap().always = error;
    }

    pub(crate) fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Server-side records of `kind`.
    pub(crate) fn records(&self, kind: EntityKind) -> Vec<ServerRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<_> = state
            .records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    async fn enter(&self, call: FakeCall) -> Result<(), ApiError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.call_started.notify_waiters();
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| ApiError::Cancelled)?.forget();
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.always {
            return Err(err.clone());
        }
        Ok(())
    }
}

fn temporary_ref(refs: &WireRefs) -> Option<&str> {
    [&refs.project_id, &refs.assignee_id, &refs.task_id]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .find(|id| id.starts_with(TEMP_PREFIX))
}

fn not_found(kind: EntityKind, id: &str) -> ApiError {
    ApiError::Http {
        status: 404,
        message: format!("{kind} not found: {id}"),
    }
}

impl RemoteApi for FakeApi {
    async fn create(&self, kind: EntityKind, request: &CreateRequest) -> Result<ServerRecord, ApiError> {
        self.enter(FakeCall {
            action: Action::Create,
            kind,
            id: request.client_id.clone(),
            body: serde_json::to_value(request).unwrap(),
        })
        .await?;

        if let Some(id) = temporary_ref(&request.refs) {
            return Err(ApiError::Http {
                status: 400,
                message: format!("invalid reference {id}"),
            });
        }

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.by_client.get(&request.client_id) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let record = ServerRecord {
            id: format!("srv_{}", state.next_id),
            client_id: Some(request.client_id.clone()),
            refs: request.refs.clone(),
            fields: request.fields.clone(),
        };
        state.by_client.insert(request.client_id.clone(), record.clone());
        state.records.insert((kind, record.id.clone()), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        request: &UpdateRequest,
    ) -> Result<ServerRecord, ApiError> {
        self.enter(FakeCall {
            action: Action::Update,
            kind,
            id: id.to_string(),
            body: serde_json::to_value(request).unwrap(),
        })
        .await?;

        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&(kind, id.to_string()))
            .ok_or_else(|| not_found(kind, id))?;
        if request.refs.project_id.is_some() {
            record.refs.project_id.clone_from(&request.refs.project_id);
        }
        if request.refs.assignee_id.is_some() {
            record.refs.assignee_id.clone_from(&request.refs.assignee_id);
        }
        record.fields.extend(request.fields.clone());
        Ok(record.clone())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        self.enter(FakeCall {
            action: Action::Delete,
            kind,
            id: id.to_string(),
            body: Value::Null,
        })
        .await?;

        let mut state = self.state.lock().unwrap();
        state
            .records
            .remove(&(kind, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(kind, id))
    }
}
