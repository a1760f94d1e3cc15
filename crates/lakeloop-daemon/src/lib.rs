//! lakeloop daemon: the local development loop for a lakehouse data platform.
//!
//! Three execution contexts cooperate here:
//!
//! 1. the control-plane owner loop, the only context that touches stack
//!    state ([`daemon::owner`], [`daemon::owner_loop`]);
//! 2. a dedicated watcher thread producing filesystem change events
//!    ([`daemon::watcher`]);
//! 3. the async HTTP service front, whose handlers query state through the
//!    broker ([`api`]).
//!
//! [`daemon::orchestrator`] wires them together and owns the lifecycle.

pub mod api;
pub mod daemon;
