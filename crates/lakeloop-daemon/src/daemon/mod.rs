pub mod orchestrator;
pub mod owner;
pub mod owner_loop;
pub mod watcher;

pub use orchestrator::{Orchestrator, Phase};
pub use owner::{ControlPlaneOwner, DriverError, InfraDriver, LocalDriver};
pub use owner_loop::run_owner_loop;
pub use watcher::{ChangeEvent, ChangeKind, watch_data_root};
