//! Image Analysis
//!
//! Analyzer contract, the fixed roster of analysis kinds, and the built-in
//! analyzers.
//!
//! Every orchestration runs one task per [`AnalysisKind`]. The orchestrator
//! only sees the [`Analyzer`] trait; what an analyzer computes is up to the
//! implementation, as long as its output satisfies
//! [`AnalysisKind::validate_output`].

mod analyzer;
pub mod analyzers;
mod kind;

pub use analyzer::*;
pub use kind::*;
