//! Container Watcher
//!
//! Turns files appearing under the container root into [`ImageRef`]
//! notifications. Events are debounced (500ms) with `notify-debouncer-mini`
//! and filtered through [`ImageFilter`]. Delivery is at-least-once. Each
//! reference carries the object version (size and modification time), so a
//! rewritten file is a new image while repeated events for one write share an id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use tokio::sync::{mpsc, oneshot};
use walkdir::WalkDir;

use crate::core::storage::{BlobMetadata, LocalBlobStore};
use crate::core::{CoreError, CoreResult, ImageRef};

use super::ImageFilter;

/// Debounce window for filesystem events
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a container root for new image uploads
pub struct ContainerWatcher {
    /// Dropping this stops the watcher thread
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ContainerWatcher {
    /// Starts watching `container_root` recursively.
    ///
    /// Each image that exists after its debounced event is sent on `tx`
    /// (blocking while the channel is full). The watcher stops when
    /// [`ContainerWatcher::stop`] is called, the watcher is dropped, or the
    /// receiver goes away.
    pub fn start(
        container_root: &Path,
        filter: ImageFilter,
        tx: mpsc::Sender<ImageRef>,
    ) -> CoreResult<Self> {
        std::fs::create_dir_all(container_root)?;
        let root = container_root.canonicalize()?;
        let locator = LocalBlobStore::new(root.clone());

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, event_tx)
            .map_err(|e| CoreError::WatcherError(format!("Failed to create watcher: {}", e)))?;
        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)
            .map_err(|e| {
                CoreError::WatcherError(format!("Failed to watch {}: {}", root.display(), e))
            })?;

        tracing::info!(root = %root.display(), "Container watcher started");

        std::thread::spawn(move || {
            let _debouncer = debouncer;

            loop {
                if stop_rx.try_recv().is_ok() {
                    tracing::debug!("Container watcher stopped by signal");
                    break;
                }
                if tx.is_closed() {
                    tracing::debug!("Image channel closed, stopping watcher");
                    break;
                }

                match event_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(Ok(events)) => {
                        for event in events {
                            if event.kind != DebouncedEventKind::Any {
                                continue;
                            }
                            let Some(image) = image_for(&locator, &filter, &event.path) else {
                                continue;
                            };
                            tracing::debug!(
                                image_id = %image.id(),
                                location = image.location(),
                                "Image upload detected"
                            );
                            if tx.blocking_send(image).is_err() {
                                tracing::debug!("Image channel closed, stopping watcher");
                                return;
                            }
                        }
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(error = %error, "Container watcher error");
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        tracing::debug!("Watcher channel disconnected, stopping");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            stop_tx: Some(stop_tx),
        })
    }

    /// Stops the watcher
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ContainerWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the notification for a file, if it is an existing image upload
fn image_for(locator: &LocalBlobStore, filter: &ImageFilter, path: &Path) -> Option<ImageRef> {
    let location = locator.location_for(path)?;
    if !filter.is_image(Path::new(&location)) {
        return None;
    }
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let blob = BlobMetadata::from_fs(&meta);
    Some(
        ImageRef::new(&location)
            .with_size(blob.size_bytes)
            .with_version(blob.version()),
    )
}

/// Lists images already present under `container_root`, sorted by location.
///
/// Used to backfill uploads that arrived while nothing was watching.
pub fn scan_existing(container_root: &Path, filter: &ImageFilter) -> CoreResult<Vec<ImageRef>> {
    if !container_root.exists() {
        return Ok(Vec::new());
    }
    let root: PathBuf = container_root.canonicalize()?;
    let locator = LocalBlobStore::new(root.clone());

    let mut images = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false).min_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable container entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(image) = image_for(&locator, filter, entry.path()) {
            images.push(image);
        }
    }

    images.sort_by(|a, b| a.location().cmp(b.location()));
    tracing::info!(root = %root.display(), found = images.len(), "Container scan finished");
    Ok(images)
}
