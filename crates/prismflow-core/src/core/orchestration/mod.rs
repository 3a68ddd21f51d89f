//! Orchestration Module
//!
//! Durable fan-out/fan-in of the analyzer roster over one image.
//!
//! Features:
//! - Orchestration records persisted before dispatch and after every task transition
//! - Per-attempt timeouts, bounded retries with linear backoff, panic isolation
//! - Lease-fenced state stores (SQLite or one JSON file per record)
//! - Startup recovery of interrupted orchestrations

mod file_store;
mod models;
mod orchestrator;
mod recovery;
mod state_store;

pub use file_store::FileStateStore;
pub use models::*;
pub use orchestrator::{Orchestrator, OrchestratorConfig, StartOutcome};
pub use recovery::RecoveryReport;
pub use state_store::{OrchestrationStateStore, SqliteStateStore};
