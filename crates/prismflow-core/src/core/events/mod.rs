//! Events Module
//!
//! Upload notifications: a debounced container watcher and a startup scan
//! for images already present.

mod filter;
mod watcher;

pub use filter::{ImageFilter, IMAGE_EXTENSIONS};
pub use watcher::{scan_existing, ContainerWatcher, DEBOUNCE};
