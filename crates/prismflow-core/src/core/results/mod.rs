//! Results Module
//!
//! Committed per-image summaries: the merged model, durable storage and the
//! query view.

mod models;
mod query;
mod store;

pub use models::*;
pub use query::*;
pub use store::*;
