pub mod agent;
pub mod config;
pub mod crew;
pub mod decision;
pub mod error;
pub mod flow;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod runtime;
pub mod service;
pub mod state;
pub mod tools;
pub mod utils;

pub use agent::{
    register_agent, Agent, AgentContext, AgentFactoryRegistry, AgentInput, AgentRegistry,
    AgentResponse, AgentRuntime, EchoAgent, FnAgent, LlmAgent, ToolCallRecord, UpstreamOutput,
};
pub use config::{EngineConfig, EnvConfig, WorkflowConfig};
pub use crew::{
    AgentCrew, AgentExecutionInfo, AgentTask, CrewMode, CrewResult, CrewStatus, DependencyGraph,
    ExecutionStatus,
};
pub use decision::{
    ConsensusLevel, DecisionFlowNode, DecisionMode, DecisionResult, DecisionSchema,
    EscalationPolicy, HumanChannel, HumanResponse, Vote, VoteWeighting,
};
pub use error::{CrewError, Result};
pub use flow::{
    condition_always, condition_decision_equals, condition_from_fn, condition_metadata_equals,
    condition_output_contains, condition_state_absent, condition_state_equals,
    condition_state_exists, AgentsFlow, CompletionPolicy, FlowPlan, NodeOptions, NodeState,
    TransitionCondition,
};
pub use llm::{DynLlmClient, LlmClient, LlmMessage, LlmRequest, LlmResponse, LlmToolCall, LocalEchoClient};
pub use memory::{AgentResult, Embedder, ExecutionMemory, HashingEmbedder, MemorySnapshot};
pub use orchestrator::{AgentTool, OrchestratorAgent};
pub use runtime::{AgentInvoker, Invocation};
pub use service::{JobRecord, JobStatus, JobTracker};
pub use state::{ContextStore, FlowContext, MemoryStore};
pub use tools::{ResultRetrievalTool, Tool, ToolInvocation, ToolRegistry, ToolSpec};
pub use utils::{ConfigValidator, LoggingConfig};
