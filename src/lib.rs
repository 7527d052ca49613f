//! Intent operator - turns Intent resources into Jobs and fans out dependents
//!
//! # Architecture
//!
//! Watch notifications for Intents and Jobs are translated into events and
//! pushed onto a deduplicating, rate-limited work queue. A pool of workers
//! pulls events and dispatches them by kind:
//! - an added Intent gets exactly one parent Job named after it
//! - a parent Job that succeeds gets five owned dependent Jobs
//!
//! All reads come from reflector caches; all writes are Job creates guarded
//! by existence checks, so every step is safe to repeat.
//!
//! # Modules
//!
//! - [`crd`] - The `Intent` custom resource
//! - [`job`] - Job manifests, naming and phase classification
//! - [`event`] - Queue events and their deduplication keys
//! - [`queue`] - Work queue with delayed and rate-limited requeues
//! - [`controller`] - Reconciler, completion watcher and worker pool
//! - [`watch`] - Reflector-backed caches feeding the queue
//! - [`shutdown`] - Signal handling
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod event;
pub mod job;
pub mod queue;
pub mod shutdown;
pub mod telemetry;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every object this operator creates
pub const FIELD_MANAGER: &str = "intent-operator";
