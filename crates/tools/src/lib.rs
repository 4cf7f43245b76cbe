pub mod dispatcher;
pub mod echo;
pub mod registry;
pub mod traits;

pub use dispatcher::{CallDisposition, CallOutcome, DispatcherConfig, ToolCallDispatcher};
pub use echo::EchoTool;
pub use registry::ToolRegistry;
pub use traits::{ToolError, ToolHandler};
