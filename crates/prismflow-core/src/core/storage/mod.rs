//! Storage Module
//!
//! Raw image access (blob store) and the SQLite connection wrapper shared by
//! the durable stores.

mod blob;
mod db;

pub use blob::*;
pub use db::*;
