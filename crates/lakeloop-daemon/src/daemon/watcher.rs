//! File system watcher for the project data directory.
//!
//! The watched root's immediate children are the managed data resources; a
//! new top-level directory means a new resource to register with the control
//! plane. The OS notification primitive blocks, so it lives on a dedicated
//! blocking thread and never touches control-plane state: classified events
//! are handed to the owner loop over a channel.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::event::CreateKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event from the data-directory watcher
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
}

/// Type of change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new top-level resource directory appeared
    DirectoryCreated,
    /// A top-level resource directory was modified
    DirectoryModified,
}

/// Watch the data root for new or modified resource directories.
///
/// Sets up a file system watcher on the data root and produces one
/// [`ChangeEvent`] per relevant change, in emission order. Only directories
/// whose immediate parent is the data root qualify; nested paths and plain
/// files are ignored.
///
/// # Arguments
///
/// * `data_root` - Watched root whose children are the managed resources
/// * `event_tx` - Channel sender for change events
/// * `cancel` - Cancellation token to stop watching
pub async fn watch_data_root(
    data_root: PathBuf,
    event_tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting data watcher for: {}", data_root.display());

    // Channel carrying raw events out of the notify callback
    let (tx, rx) = channel();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(e) = tx.send(event) {
                    error!("Failed to forward file system event: {}", e);
                }
            }
            Err(e) => {
                error!("File system watcher error: {}", e);
            }
        })
        .context("Failed to create file system watcher")?;

    watcher
        .watch(&data_root, RecursiveMode::Recursive)
        .context("Failed to watch data directory")?;

    info!("Watching {} for changes", data_root.display());

    // Drain the synchronous receiver on a blocking thread so OS delivery
    // never stalls the async scheduler.
    let cancel_clone = cancel.clone();
    let data_root_clone = data_root.clone();
    tokio::task::spawn_blocking(move || {
        loop {
            if cancel_clone.is_cancelled() {
                info!("Data watcher cancelled");
                break;
            }

            // recv_timeout keeps cancellation checks bounded without busy-waiting
            match rx.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(event) => {
                    debug!("File system event: {:?}", event);

                    if let Some(change_events) = classify_event(&data_root_clone, &event) {
                        for change_event in change_events {
                            if let Err(e) = event_tx.blocking_send(change_event) {
                                error!("Failed to send change event: {}", e);
                            }
                        }
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    continue;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("Watcher channel disconnected");
                    break;
                }
            }
        }
    })
    .await
    .context("Watcher task panicked")?;

    Ok(())
}

/// Classify a raw notify event into zero or more [`ChangeEvent`]s.
///
/// Returns `None` for irrelevant events: plain files, nested paths, removals.
/// A creation counts only when the entry is a directory and its immediate
/// parent is the watched root.
fn classify_event(data_root: &Path, event: &Event) -> Option<Vec<ChangeEvent>> {
    // Backends that report CreateKind::Any carry no entry-type hint, same as
    // modify events, so those need a per-path fs check below. A multi-path
    // event can mix files and directories.
    let (kind, check_fs) = match event.kind {
        EventKind::Create(create_kind) => match create_kind {
            CreateKind::Folder => (ChangeKind::DirectoryCreated, false),
            CreateKind::File | CreateKind::Other => return None,
            CreateKind::Any => (ChangeKind::DirectoryCreated, true),
        },
        EventKind::Modify(_) => (ChangeKind::DirectoryModified, true),
        _ => return None,
    };

    let mut events = Vec::new();
    for path in &event.paths {
        if !is_top_level(data_root, path) {
            continue;
        }
        if check_fs && !path.is_dir() {
            continue;
        }
        events.push(ChangeEvent {
            kind,
            path: path.clone(),
            observed_at: Utc::now(),
        });
    }

    if events.is_empty() { None } else { Some(events) }
}

/// A path qualifies when it sits directly under the data root.
fn is_top_level(data_root: &Path, path: &Path) -> bool {
    let rel_path = match path.strip_prefix(data_root) {
        Ok(p) => p,
        Err(_) => return false, // Not under the data root
    };

    rel_path.components().count() == 1
}
