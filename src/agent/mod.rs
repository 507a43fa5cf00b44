pub mod agent;
pub mod builtin;
pub mod factory;
pub mod message;
pub mod registry;

pub use agent::{Agent, AgentContext, AgentRuntime};
pub use builtin::{EchoAgent, FnAgent, LlmAgent};
pub use factory::{AgentFactory, AgentFactoryRegistry};
pub use message::{uuid, AgentInput, AgentResponse, ToolCallRecord, UpstreamOutput};
pub use registry::{register_agent, AgentRegistry};
