//! Run orchestration runtime: thread lifecycle, the run state machine,
//! stream relay, and wiring.

pub mod locks;
pub mod relay;
pub mod run_controller;
pub mod sse;
pub mod thread_manager;

mod orchestrator;

pub use locks::LockManager;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use relay::{RelayConfig, RunSubscription, StreamRelay};
pub use run_controller::{RunController, RunControllerConfig};
pub use thread_manager::ThreadManager;
