//! Data models for the sync engine.
//!
//! - [`EntityId`] - temporary vs canonical identifiers
//! - [`EntityRecord`] - Task / Project / TeamMember / Comment rows
//! - [`Operation`] - queued mutations and their retry bookkeeping

pub mod entity;
pub mod id;
pub mod operation;

pub use entity::{content_signature, EntityKind, EntityRecord, References, Relation};
pub use id::{new_operation_id, EntityId, TEMP_PREFIX};
pub use operation::{Action, Operation, OperationKind, OperationStatus, Payload, RefField};
