// 引擎参数与工作流配置

pub mod engine;
pub mod env;
pub mod workflow;

pub use engine::EngineConfig;
pub use env::EnvConfig;
pub use workflow::{AgentSpec, ConditionConfig, DecisionSpec, EdgeConfig, WorkflowConfig};
