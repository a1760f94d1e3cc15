//! Live file system watcher tests

use std::time::Duration;

use lakeloop_daemon::daemon::{ChangeKind, watch_data_root};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn new_top_level_directory_emits_created_event() {
    let temp = TempDir::new().unwrap();
    let data_root = temp.path().to_path_buf();
    let (event_tx, mut event_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let watcher = tokio::spawn(watch_data_root(data_root.clone(), event_tx, cancel.clone()));

    // Give the watcher a moment to install before producing changes
    tokio::time::sleep(Duration::from_millis(300)).await;

    let created = data_root.join("orders");
    std::fs::create_dir(&created).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("no event within timeout")
        .expect("event channel closed");
    assert_eq!(event.kind, ChangeKind::DirectoryCreated);
    assert_eq!(event.path, created);

    cancel.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn nested_directory_emits_nothing() {
    let temp = TempDir::new().unwrap();
    let data_root = temp.path().to_path_buf();
    std::fs::create_dir(data_root.join("orders")).unwrap();

    let (event_tx, mut event_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let watcher = tokio::spawn(watch_data_root(data_root.clone(), event_tx, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::create_dir(data_root.join("orders/nested")).unwrap();

    // Only created events matter here; a backend may surface the nested
    // create as a modify of the parent, which is a valid classification.
    let got_created = tokio::time::timeout(Duration::from_millis(800), async {
        while let Some(event) = event_rx.recv().await {
            if event.kind == ChangeKind::DirectoryCreated {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(!got_created, "nested directory must not emit a created event");

    cancel.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_joins_watcher_within_bounded_wait() {
    let temp = TempDir::new().unwrap();
    let (event_tx, _event_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let watcher = tokio::spawn(watch_data_root(
        temp.path().to_path_buf(),
        event_tx,
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .expect("watcher did not stop after cancellation")
        .unwrap()
        .unwrap();
}
