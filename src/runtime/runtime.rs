use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentRuntime;
use crate::error::Result;
use crate::state::FlowContext;
use crate::tools::{ToolInvocation, ToolRegistry, ToolSpec};

/// Executor 运行时实现
pub struct ExecutorRuntime {
    pub ctx: FlowContext,
    pub tools: Arc<ToolRegistry>,
}

#[async_trait]
impl AgentRuntime for ExecutorRuntime {
    async fn call_tool(&self, name: &str, invocation: ToolInvocation) -> Result<Value> {
        let invocation = ToolInvocation {
            name: name.to_string(),
            ..invocation
        };
        self.tools.call(invocation, &self.ctx).await
    }

    fn tools(&self) -> Vec<ToolSpec> {
        self.tools.specs()
    }
}
