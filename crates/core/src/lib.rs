pub mod error;
pub mod events;
pub mod types;

pub use error::OrchestratorError;
pub use events::StreamEvent;
pub use types::*;
