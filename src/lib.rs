//! Taskflow sync - offline-first mutation queue for the Taskflow planner
//!
//! This crate provides the sync engine and the `tfsync` CLI around it.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (EntityId, EntityRecord, Operation)
//! - [`storage`] - Key-value persistence (SQLite, file, memory)
//! - [`sync`] - Queue, mirror, reconciliation, flush and scheduler
//! - [`config`] - Store path and engine settings
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
