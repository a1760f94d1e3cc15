//! Correlated request/response broker between execution contexts.
//!
//! The control-plane owner is the only context allowed to touch stack state,
//! so every other context (HTTP handlers in particular) asks its questions
//! through a [`BrokerHandle`]. Each `send` allocates a fresh correlation id
//! and a dedicated oneshot reply channel, enqueues the request on the shared
//! request queue, and awaits the reply in bounded slices up to a total
//! deadline. A per-request reply channel means a response can never be
//! delivered to the wrong waiter, and a timed-out `send` cancels only that
//! call.

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stack::{ResourceInfo, StackOutputs};

/// Total deadline for one broker ask.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Length of one wait slice; progress is logged between slices.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Depth of the shared request queue.
pub const REQUEST_QUEUE_DEPTH: usize = 64;

/// What a caller can ask the control-plane owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    /// Snapshot of the provisioned stack
    GetStackOutputs,
    /// Metadata for one registered resource
    GetResourceInfo { name: String },
    /// Append records to a registered resource
    IngestRecords { resource: String, records: Vec<Value> },
    /// Kick off a named processing job
    TriggerJob { job: String, arguments: Value },
}

impl RequestKind {
    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::GetStackOutputs => "get_stack_outputs",
            RequestKind::GetResourceInfo { .. } => "get_resource_info",
            RequestKind::IngestRecords { .. } => "ingest_records",
            RequestKind::TriggerJob { .. } => "trigger_job",
        }
    }
}

/// Successful answer to a [`RequestKind`], variant for variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    StackOutputs(StackOutputs),
    ResourceInfo(ResourceInfo),
    Ingested { resource: String, count: usize },
    JobStarted { job: String, run_id: Uuid },
}

/// One answer, carrying the correlation id of the request it pairs with.
#[derive(Debug, Clone)]
pub struct BrokerResponse {
    pub id: Uuid,
    pub result: Result<ResponseBody, String>,
}

/// One ask, created by [`BrokerHandle::send`] and consumed exactly once by
/// the owner loop.
#[derive(Debug)]
pub struct BrokerRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    reply: oneshot::Sender<BrokerResponse>,
}

impl BrokerRequest {
    /// Split the request into its kind and the responder that must be used
    /// to answer it.
    pub fn split(self) -> (RequestKind, Responder) {
        (
            self.kind,
            Responder {
                id: self.id,
                reply: self.reply,
            },
        )
    }

    /// Answer the request in place.
    pub fn respond(self, result: Result<ResponseBody, String>) {
        let (_, responder) = self.split();
        responder.respond(result);
    }
}

/// Write-once reply slot for one request.
#[derive(Debug)]
pub struct Responder {
    id: Uuid,
    reply: oneshot::Sender<BrokerResponse>,
}

impl Responder {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver the response to the waiter. If the waiter has already timed
    /// out and gone away this is a no-op.
    pub fn respond(self, result: Result<ResponseBody, String>) {
        let id = self.id;
        if self
            .reply
            .send(BrokerResponse { id, result })
            .is_err()
        {
            debug!("broker waiter for {id} gone before response was delivered");
        }
    }
}

/// Broker failure as seen by the caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No response arrived before the total deadline
    #[error("no broker response after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The owner loop is gone (shutdown or crash)
    #[error("broker channel closed")]
    ChannelClosed,

    /// The owner answered with an error
    #[error("{0}")]
    Remote(String),
}

/// Cloneable sending side of the broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
    deadline: Duration,
    retry_interval: Duration,
}

/// Create a broker with the given request queue depth. The receiver goes to
/// the owner loop; the handle can be cloned into any context.
pub fn broker_channel(depth: usize) -> (BrokerHandle, mpsc::Receiver<BrokerRequest>) {
    let (tx, rx) = mpsc::channel(depth);
    (
        BrokerHandle {
            tx,
            deadline: REQUEST_TIMEOUT,
            retry_interval: RETRY_INTERVAL,
        },
        rx,
    )
}

impl BrokerHandle {
    /// Override the total deadline and wait-slice length. Used by tests and
    /// callers with tighter latency budgets.
    pub fn with_deadlines(mut self, deadline: Duration, retry_interval: Duration) -> Self {
        self.deadline = deadline;
        self.retry_interval = retry_interval;
        self
    }

    /// Ask the control-plane owner a question and await the paired answer.
    ///
    /// Suspends only the calling task. Fails with [`BrokerError::Timeout`]
    /// when no answer arrives within the deadline, and with
    /// [`BrokerError::ChannelClosed`] when the owner loop has shut down
    /// (including when it drains the queue during shutdown and drops the
    /// reply slot).
    pub async fn send(&self, kind: RequestKind) -> Result<ResponseBody, BrokerError> {
        let id = Uuid::new_v4();
        let kind_name = kind.name();
        let (reply_tx, mut reply_rx) = oneshot::channel();

        debug!("broker request {id} ({kind_name})");
        self.tx
            .send(BrokerRequest {
                id,
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        let started = Instant::now();
        loop {
            match tokio::time::timeout(self.retry_interval, &mut reply_rx).await {
                Ok(Ok(response)) => {
                    if response.id != id {
                        // Unreachable with per-request reply channels; kept as
                        // a correlation guard.
                        warn!(
                            "broker response id {} does not match request {id}",
                            response.id
                        );
                        return Err(BrokerError::Remote(
                            "response correlation id mismatch".to_string(),
                        ));
                    }
                    debug!("broker response for {id} after {:?}", started.elapsed());
                    return response.result.map_err(BrokerError::Remote);
                }
                Ok(Err(_)) => return Err(BrokerError::ChannelClosed),
                Err(_) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.deadline {
                        warn!("broker request {id} ({kind_name}) timed out after {elapsed:?}");
                        return Err(BrokerError::Timeout { elapsed });
                    }
                    debug!("still waiting on broker request {id} ({kind_name}), {elapsed:?} elapsed");
                }
            }
        }
    }
}
