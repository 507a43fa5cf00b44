pub mod registry;
pub mod retrieval;
pub mod tool;

pub use registry::ToolRegistry;
pub use retrieval::{ResultRetrievalTool, RETRIEVAL_TOOL_NAME};
pub use tool::{Tool, ToolInvocation, ToolSpec};
