//! prismflow Core Engine
//!
//! Handles image ingestion, analyzer dispatch, durable orchestration state and
//! result persistence.

pub mod analysis;
pub mod events;
pub mod orchestration;
pub mod results;
pub mod settings;
pub mod storage;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
