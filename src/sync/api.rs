//! Remote mutation API contract.
//!
//! The engine talks to the server through [`RemoteApi`]: one create, update
//! and delete call per entity kind. Creates carry the client id, which the
//! server treats as an idempotency key, so redelivering a create after a
//! lost response returns the original record instead of a duplicate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;

use crate::model::{EntityId, EntityKind, EntityRecord, References, Relation};

/// Transport or server failure for a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Connection refused, DNS failure, reset, ...
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// Non-success HTTP status with the server's message.
    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    /// The referenced entity no longer exists server-side.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Success status but an unreadable body.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The dispatch was abandoned because the engine shut down.
    #[error("Request cancelled")]
    Cancelled,
}

/// Relationship fields in wire form (canonical id strings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl From<&References> for WireRefs {
    fn from(refs: &References) -> Self {
        let wire = |r: Relation| refs.get(r).map(EntityId::to_wire);
        Self {
            project_id: wire(Relation::Project),
            assignee_id: wire(Relation::Assignee),
            task_id: wire(Relation::Task),
        }
    }
}

impl From<&WireRefs> for References {
    fn from(refs: &WireRefs) -> Self {
        let parse = |s: &Option<String>| s.as_deref().map(EntityId::from_wire);
        Self {
            project_id: parse(&refs.project_id),
            assignee_id: parse(&refs.assignee_id),
            task_id: parse(&refs.task_id),
        }
    }
}

/// Body of a create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Client-minted id in wire form (`tmp_...`), the idempotency key.
    pub client_id: String,
    #[serde(flatten)]
    pub refs: WireRefs,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Body of an update call (a partial patch).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(flatten)]
    pub refs: WireRefs,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Entity as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    /// Echo of the create's client id, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub refs: WireRefs,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ServerRecord {
    /// Convert into a confirmed mirror record.
    #[must_use]
    pub fn into_entity(self) -> EntityRecord {
        let refs = References::from(&self.refs);
        EntityRecord::confirmed(EntityId::canonical(self.id), refs, self.fields)
    }
}

/// The server's mutation endpoints.
///
/// Implemented over HTTP by [`super::HttpRemoteApi`]; tests use an in-memory
/// fake. Futures must be `Send` so flushes can run on a spawned task.
pub trait RemoteApi: Send + Sync {
    /// Create an entity. Replaying the same `client_id` must return the
    /// original record.
    fn create(
        &self,
        kind: EntityKind,
        request: &CreateRequest,
    ) -> impl Future<Output = Result<ServerRecord, ApiError>> + Send;

    /// Apply a partial update and return the updated record.
    fn update(
        &self,
        kind: EntityKind,
        id: &str,
        request: &UpdateRequest,
    ) -> impl Future<Output = Result<ServerRecord, ApiError>> + Send;

    /// Delete an entity.
    fn delete(&self, kind: EntityKind, id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl<T: RemoteApi> RemoteApi for std::sync::Arc<T> {
    fn create(
        &self,
        kind: EntityKind,
        request: &CreateRequest,
    ) -> impl Future<Output = Result<ServerRecord, ApiError>> + Send {
        (**self).create(kind, request)
    }

    fn update(
        &self,
        kind: EntityKind,
        id: &str,
        request: &UpdateRequest,
    ) -> impl Future<Output = Result<ServerRecord, ApiError>> + Send {
        (**self).update(kind, id, request)
    }

    fn delete(&self, kind: EntityKind, id: &str) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).delete(kind, id)
    }
}
