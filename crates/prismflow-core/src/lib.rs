//! prismflow core library
//!
//! Durable fan-out/fan-in orchestration of image analysis.
//!
//! An image deposited in the container is turned into an [`ImageRef`], the
//! [`Orchestrator`] persists an orchestration record, dispatches every
//! analyzer of the fixed roster concurrently (with per-attempt timeouts and
//! bounded retries), and commits one merged [`ResultSummary`] to the result
//! store. Incomplete orchestrations survive restarts and are resumed by
//! [`Orchestrator::recover`].

pub mod core;

pub use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput, AnalyzerRoster};
pub use crate::core::events::{scan_existing, ContainerWatcher, ImageFilter};
pub use crate::core::orchestration::{
    OrchestrationRecord, OrchestrationStatus, Orchestrator, OrchestratorConfig, RecoveryReport,
    StartOutcome,
};
pub use crate::core::results::{QueryService, ResultSummary};
pub use crate::core::settings::PipelineSettings;
pub use crate::core::{CoreError, CoreResult, ImageRef};
