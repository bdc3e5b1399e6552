/*
 * Ragline Worker - Stage Worker Runtime
 *
 * Shared HTTP runtime for the pipeline's stage workers.
 *
 * Architecture:
 * - Stage Service (pluggable task logic)
 * - Worker Harness (health + task endpoints, response envelope)
 * - Idle Timer (inactivity-driven shutdown)
 * - Lazy Model (load-on-first-use model handles)
 */

// Public modules
pub mod error;
pub mod harness;
pub mod idle;
pub mod service;

// Re-exports
pub use error::{Result, WorkerError};
pub use harness::{BoundWorker, WorkerHarness};
pub use idle::IdleTimer;
pub use service::{LazyModel, StageService};
