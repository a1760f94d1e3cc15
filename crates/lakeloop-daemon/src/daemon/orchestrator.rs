//! Lifecycle orchestration for the development loop.
//!
//! Wires the watcher thread, the owner loop and the service front together,
//! supervises them while running, and tears them all down when any of them
//! fails, when a signal arrives, or when the caller cancels.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lakeloop_core::broker::{REQUEST_QUEUE_DEPTH, broker_channel};
use lakeloop_core::config::ProjectConfig;

use crate::api::{self, ApiState};
use crate::daemon::owner::{ControlPlaneOwner, InfraDriver};
use crate::daemon::owner_loop::run_owner_loop;
use crate::daemon::watcher::watch_data_root;

/// Depth of the change-event queue between the watcher and the owner loop.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Bounded wait for each task to finish during shutdown before it is
/// force-stopped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of the development loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting-down",
            Phase::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state machine for the dev loop. One orchestrator runs one loop;
/// a fresh process starts over from `Initializing` with no retained state.
pub struct Orchestrator {
    config: ProjectConfig,
    skip_provision: bool,
    phase_tx: watch::Sender<Phase>,
}

impl Orchestrator {
    pub fn new(config: ProjectConfig, skip_provision: bool) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Initializing);
        Self {
            config,
            skip_provision,
            phase_tx,
        }
    }

    /// Subscribe to lifecycle transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        info!("Lifecycle: {phase}");
        let _ = self.phase_tx.send(phase);
    }

    /// Run the full loop until `cancel` fires or a task fails.
    ///
    /// Startup order: ensure the data root exists, one-time stack
    /// materialization (unless skipped), then the watcher, the owner loop and
    /// the service front concurrently. Any task finishing with an error
    /// cancels the shared token, so no sibling is ever left orphaned.
    pub async fn run(&self, driver: Box<dyn InfraDriver>, cancel: CancellationToken) -> Result<()> {
        self.set_phase(Phase::Initializing);

        std::fs::create_dir_all(&self.config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.config.data_dir.display())
        })?;

        let mut owner = ControlPlaneOwner::new(driver, self.config.data_dir.clone());

        if self.skip_provision {
            info!("Skipping initial stack materialization");
        } else {
            // Synchronous on purpose: nothing else runs until the stack and
            // the resources for pre-existing data directories exist.
            owner
                .materialize()
                .context("Initial stack materialization failed")?;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (broker, request_rx) = broker_channel(REQUEST_QUEUE_DEPTH);

        // First task failure wins and triggers shutdown of the siblings
        let failure: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

        let mut watcher_task = supervise(
            "data watcher",
            watch_data_root(self.config.data_dir.clone(), event_tx, cancel.clone()),
            cancel.clone(),
            failure.clone(),
        );

        let api_state = ApiState {
            broker,
            data_dir: self.config.data_dir.clone(),
        };
        let mut api_task = supervise(
            "service front",
            api::serve(self.config.api_port, api_state, cancel.clone()),
            cancel.clone(),
            failure.clone(),
        );

        let owner_cancel = cancel.clone();
        let mut owner_task = supervise(
            "owner loop",
            async move {
                run_owner_loop(&mut owner, event_rx, request_rx, owner_cancel).await
            },
            cancel.clone(),
            failure.clone(),
        );

        self.set_phase(Phase::Running);

        // A stop condition is a signal/explicit stop (token cancelled from
        // outside) or any supervised task cancelling it on failure.
        cancel.cancelled().await;

        self.set_phase(Phase::ShuttingDown);

        // The owner loop drains both queues on its way out; join it first so
        // pending broker callers are answered within the grace period.
        join_within_grace("owner loop", &mut owner_task).await;
        join_within_grace("service front", &mut api_task).await;
        join_within_grace("data watcher", &mut watcher_task).await;

        self.set_phase(Phase::Stopped);

        if let Some(e) = failure.lock().expect("failure slot poisoned").take() {
            return Err(e);
        }
        Ok(())
    }
}

/// Run a component future on its own task; on error, record the first
/// failure and cancel every sibling.
fn supervise(
    name: &'static str,
    fut: impl Future<Output = Result<()>> + Send + 'static,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!("{name} failed: {e:#}");
            let mut slot = failure.lock().expect("failure slot poisoned");
            if slot.is_none() {
                *slot = Some(e.context(format!("{name} failed")));
            }
            drop(slot);
            cancel.cancel();
        }
    })
}

/// Wait for a task within the shutdown grace period, then force-stop it.
async fn join_within_grace(name: &str, task: &mut JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut *task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{name} task panicked: {e}"),
        Err(_) => {
            error!("{name} did not stop within {SHUTDOWN_GRACE:?}, aborting");
            task.abort();
        }
    }
}
