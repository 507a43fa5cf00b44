use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::memory::ExecutionMemory;
use crate::state::FlowContext;
use crate::tools::{ToolInvocation, ToolSpec};

use super::message::{AgentInput, AgentResponse};

#[derive(Clone, Copy)]
pub struct AgentContext<'a> {
    pub flow_ctx: &'a FlowContext,
    pub memory: &'a ExecutionMemory,
    pub runtime: &'a dyn AgentRuntime,
}

impl<'a> AgentContext<'a> {
    pub fn flow(&self) -> &'a FlowContext {
        self.flow_ctx
    }

    pub fn memory(&self) -> &'a ExecutionMemory {
        self.memory
    }

    /// 其他 agent 的最新结果，格式化为 prompt
    pub fn peer_context(&self, agent_id: &str) -> String {
        self.memory.get_context_for_agent(agent_id)
    }

    pub async fn call_tool(&self, name: &str, input: Value) -> Result<Value> {
        self.runtime
            .call_tool(name, ToolInvocation::new(name, input))
            .await
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn call_tool(&self, name: &str, invocation: ToolInvocation) -> Result<Value>;
    fn tools(&self) -> Vec<ToolSpec>;
}

/// 编排核心唯一依赖的能力
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn model(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, input: AgentInput, ctx: &AgentContext<'_>) -> Result<AgentResponse>;
}
