//! Owner-side processing loop.
//!
//! One task owns the [`ControlPlaneOwner`] and interleaves two processors on
//! a single `select!`: the event processor drains watcher change events into
//! control-plane mutations, the request processor drains broker requests into
//! queries/mutations and answers each waiter through its reply slot. Awaiting
//! `recv()` on both queues is the idle backoff; a failed iteration logs,
//! answers the waiter if one exists, sleeps briefly, and keeps going.
//!
//! On cancellation the loop closes and drains both queues before returning,
//! so no stale event or unanswered request survives shutdown.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lakeloop_core::broker::{BrokerRequest, RequestKind, ResponseBody};

use crate::daemon::owner::ControlPlaneOwner;
use crate::daemon::watcher::{ChangeEvent, ChangeKind};

/// Pause after a failed iteration before processing the next item.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Run the owner loop until cancelled or both queues close.
///
/// This is the only place [`ControlPlaneOwner`] methods are called while the
/// loop is alive, which is what serializes all stack-state access.
pub async fn run_owner_loop(
    owner: &mut ControlPlaneOwner,
    mut event_rx: mpsc::Receiver<ChangeEvent>,
    mut request_rx: mpsc::Receiver<BrokerRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Owner loop running");

    loop {
        let failed = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Owner loop cancelled");
                break;
            }
            maybe_request = request_rx.recv() => match maybe_request {
                Some(request) => process_request(owner, request),
                None => {
                    warn!("Broker request channel closed");
                    break;
                }
            },
            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => process_event(owner, event),
                None => {
                    warn!("Change event channel closed");
                    break;
                }
            },
        };

        if failed {
            tokio::time::sleep(ERROR_BACKOFF).await;
        }
    }

    drain_queues(&mut event_rx, &mut request_rx);
    Ok(())
}

/// Dispatch one broker request to the matching owner operation and answer
/// the waiter. Returns true when the operation failed.
fn process_request(owner: &mut ControlPlaneOwner, request: BrokerRequest) -> bool {
    let id = request.id;
    debug!("Processing broker request {id} ({})", request.kind.name());

    let (kind, responder) = request.split();
    let result = match kind {
        RequestKind::GetStackOutputs => Ok(ResponseBody::StackOutputs(owner.stack_outputs())),
        RequestKind::GetResourceInfo { name } => owner
            .resource_info(&name)
            .map(ResponseBody::ResourceInfo)
            .map_err(|e| e.to_string()),
        RequestKind::IngestRecords { resource, records } => owner
            .ingest_records(&resource, &records)
            .map(|count| ResponseBody::Ingested { resource, count })
            .map_err(|e| e.to_string()),
        RequestKind::TriggerJob { job, arguments } => owner
            .trigger_job(&job, &arguments)
            .map(|run_id| ResponseBody::JobStarted { job, run_id })
            .map_err(|e| e.to_string()),
    };

    let failed = result.is_err();
    if let Err(ref message) = result {
        error!("Broker request {id} failed: {message}");
    }
    responder.respond(result);
    failed
}

/// Apply one change event to the control plane. Returns true on failure.
fn process_event(owner: &mut ControlPlaneOwner, event: ChangeEvent) -> bool {
    match event.kind {
        ChangeKind::DirectoryCreated => {
            info!("New data directory: {}", event.path.display());
            if let Err(e) = owner.register_resource_for_path(&event.path) {
                error!("Failed to register resource for {}: {e}", event.path.display());
                return true;
            }
            false
        }
        ChangeKind::DirectoryModified => {
            // Re-sync on modification is a deferred capability; the event is
            // classified and delivered but triggers no mutation yet.
            debug!("Modified data directory (no-op): {}", event.path.display());
            false
        }
    }
}

/// Close and empty both queues. Pending broker requests are answered with a
/// shutdown error so their waiters unblock immediately instead of timing
/// out; pending change events are discarded.
fn drain_queues(
    event_rx: &mut mpsc::Receiver<ChangeEvent>,
    request_rx: &mut mpsc::Receiver<BrokerRequest>,
) {
    event_rx.close();
    request_rx.close();

    let mut dropped_events = 0usize;
    while let Ok(_event) = event_rx.try_recv() {
        dropped_events += 1;
    }

    let mut answered = 0usize;
    while let Ok(request) = request_rx.try_recv() {
        request.respond(Err("control plane shutting down".to_string()));
        answered += 1;
    }

    if dropped_events > 0 || answered > 0 {
        info!(
            "Drained owner queues: {dropped_events} event(s) dropped, {answered} request(s) answered with shutdown error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::owner::LocalDriver;
    use chrono::Utc;
    use lakeloop_core::broker::broker_channel;
    use lakeloop_core::config::{ConfigOverrides, ProjectConfig, resolve_config};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_setup() -> (TempDir, ProjectConfig) {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("lakeloop.toml"), "project_name = \"demo\"").unwrap();
        std::fs::create_dir_all(temp.path().join("data")).unwrap();
        let config = resolve_config(&ConfigOverrides::default(), temp.path()).unwrap();
        (temp, config)
    }

    fn test_owner(config: &ProjectConfig) -> ControlPlaneOwner {
        let driver = LocalDriver::new(config).unwrap();
        ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone())
    }

    fn created(config: &ProjectConfig, name: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::DirectoryCreated,
            path: config.data_dir.join(name),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn created_event_registers_resource_once() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (handle, request_rx) = broker_channel(16);
        let cancel = CancellationToken::new();

        event_tx.send(created(&config, "orders")).await.unwrap();
        event_tx.send(created(&config, "orders")).await.unwrap();

        let loop_cancel = cancel.clone();
        let owner_task = tokio::spawn(async move {
            run_owner_loop(&mut owner, event_rx, request_rx, loop_cancel)
                .await
                .unwrap();
            owner
        });

        // No ordering guarantee between queued events and this request, so
        // poll until the registration lands.
        let mut registered = None;
        for _ in 0..50 {
            match handle
                .send(RequestKind::GetResourceInfo {
                    name: "orders".to_string(),
                })
                .await
            {
                Ok(ResponseBody::ResourceInfo(info)) => {
                    registered = Some(info);
                    break;
                }
                Ok(other) => panic!("unexpected body: {other:?}"),
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert_eq!(registered.expect("resource never registered").name, "orders");

        cancel.cancel();
        let owner = owner_task.await.unwrap();
        assert_eq!(owner.stack_outputs().tables.len(), 1);
    }

    #[tokio::test]
    async fn modified_event_is_a_no_op() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (handle, request_rx) = broker_channel(16);
        let cancel = CancellationToken::new();

        event_tx
            .send(ChangeEvent {
                kind: ChangeKind::DirectoryModified,
                path: config.data_dir.join("orders"),
                observed_at: Utc::now(),
            })
            .await
            .unwrap();

        let loop_cancel = cancel.clone();
        let owner_task = tokio::spawn(async move {
            run_owner_loop(&mut owner, event_rx, request_rx, loop_cancel)
                .await
                .unwrap();
            owner
        });

        let body = handle.send(RequestKind::GetStackOutputs).await.unwrap();
        match body {
            ResponseBody::StackOutputs(outputs) => assert!(outputs.tables.is_empty()),
            other => panic!("unexpected body: {other:?}"),
        }

        cancel.cancel();
        let owner = owner_task.await.unwrap();
        // The modified event produced no mutation
        assert!(owner.stack_outputs().tables.is_empty());
    }

    #[tokio::test]
    async fn failed_request_answers_waiter_and_loop_continues() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (handle, request_rx) = broker_channel(16);
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let owner_task = tokio::spawn(async move {
            run_owner_loop(&mut owner, event_rx, request_rx, loop_cancel)
                .await
                .unwrap();
        });

        let err = handle
            .send(RequestKind::GetResourceInfo {
                name: "missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown resource"));

        // The loop must still answer subsequent requests. The event and the
        // ingest race through select!, so poll until the registration lands.
        event_tx.send(created(&config, "orders")).await.unwrap();
        let mut ingested = None;
        for _ in 0..50 {
            match handle
                .send(RequestKind::IngestRecords {
                    resource: "orders".to_string(),
                    records: vec![json!({"id": 1})],
                })
                .await
            {
                Ok(body) => {
                    ingested = Some(body);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert_eq!(
            ingested.expect("ingest never succeeded"),
            ResponseBody::Ingested {
                resource: "orders".to_string(),
                count: 1,
            }
        );

        cancel.cancel();
        owner_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_answers_pending_requests_and_empties_queues() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (handle, request_rx) = broker_channel(16);
        let cancel = CancellationToken::new();

        // Cancelled before the loop starts: queued work must still be drained
        cancel.cancel();
        event_tx.send(created(&config, "orders")).await.unwrap();

        let sender = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(RequestKind::GetStackOutputs).await }
        });
        // Let the request land on the queue before the loop drains it
        tokio::time::sleep(Duration::from_millis(50)).await;

        run_owner_loop(&mut owner, event_rx, request_rx, cancel)
            .await
            .unwrap();

        let err = sender.await.unwrap().unwrap_err();
        assert!(
            err.to_string().contains("shutting down") || err.to_string().contains("closed"),
            "unexpected error: {err}"
        );

        // The drained event never became a mutation
        assert!(owner.stack_outputs().tables.is_empty());
    }
}
