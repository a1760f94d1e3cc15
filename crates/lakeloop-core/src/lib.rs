//! Core types for lakeloop, a local development loop for a lakehouse data
//! platform.
//!
//! This crate provides the pieces that are shared between the daemon and any
//! front-end surface:
//!
//! - [`config`]: layered project configuration (`lakeloop.toml`, `LAKELOOP_*`
//!   env vars, CLI overrides)
//! - [`broker`]: the correlated request/response bridge between the
//!   control-plane owner and other execution contexts
//! - [`stack`]: the stack-output / resource data model
//! - [`logging`]: process-level tracing initialization

pub mod broker;
pub mod config;
pub mod logging;
pub mod stack;

pub use broker::{BrokerError, BrokerHandle, BrokerRequest, RequestKind, ResponseBody};
pub use config::{ConfigError, ConfigOverrides, ProjectConfig};
pub use stack::{ResourceInfo, ResourceRecord, ResourceType, StackOutputs};
