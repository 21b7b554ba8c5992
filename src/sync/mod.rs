//! Offline-first synchronization.
//!
//! Local mutations are applied to an optimistic mirror and recorded as
//! operations in a durable queue; a single-flight flush drains the queue
//! against the remote API in order:
//!
//! - **Queue**: FIFO of pending operations, persisted after every change
//! - **Mirror**: optimistic copies of tasks, projects, team members, comments
//! - **Reconciliation**: temporary → canonical id map and queue rewriting
//! - **Classifier**: recoverable vs unrecoverable failures, retry backoff
//! - **Dead letter**: abandoned operations kept for inspection and requeue
//! - **Scheduler**: timer, back-online and manual flush triggers
//! - **Realtime**: server events mapped to read-cache invalidations
//!
//! # Example
//!
//! ```ignore
//! use tfsync::sync::{spawn_scheduler, EngineSettings, HttpRemoteApi, SyncEngine};
//!
//! let api = HttpRemoteApi::new("https://taskflow.example", Some(token));
//! let engine = Arc::new(SyncEngine::open(api, store, EngineSettings::default())?);
//! let project = engine.create(EntityKind::Project, References::default(), fields)?;
//! let scheduler = spawn_scheduler(engine.clone());
//! scheduler.notify_online();
//! ```

mod api;
mod cancel;
mod classify;
mod dead_letter;
mod engine;
mod http;
mod mirror;
mod queue;
mod realtime;
mod reconcile;
mod scheduler;
mod status;
mod types;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, CreateRequest, RemoteApi, ServerRecord, UpdateRequest, WireRefs};
pub use cancel::CancelToken;
pub use classify::{classify, DeadLetterReason, ErrorClass, FailureAction, RetryPolicy};
pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use engine::{Enqueued, SyncEngine};
pub use http::{HttpRemoteApi, DEFAULT_REQUEST_TIMEOUT};
pub use mirror::{EntityMirror, LocalMutation, MergeOutcome};
pub use queue::{AppendOutcome, QueueStore};
pub use realtime::{
    handle_event, run_listener, CacheInvalidator, InvalidationScope, ReadView, RealtimeEvent,
};
pub use reconcile::{reconcile_queue, resolve_payload, unresolved, IdMap, DEPENDENCY_SCHEMA};
pub use scheduler::{spawn_scheduler, SchedulerHandle, SyncTrigger};
pub use status::{format_age, print_status, summarize, QueueSummary};
pub use types::{EngineSettings, FlushReport, SyncPhase, SyncStatus};
