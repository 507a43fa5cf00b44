use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{CrewError, Result};
use crate::memory::ExecutionMemory;
use crate::state::FlowContext;
use crate::tools::tool::{Tool, ToolInvocation, ToolSpec};

pub const RETRIEVAL_TOOL_NAME: &str = "retrieve_results";

const DEFAULT_TOP_K: usize = 3;

/// 让 agent 读取本次运行中其他 agent 的结果（只读）
#[derive(Clone)]
pub struct ResultRetrievalTool {
    memory: ExecutionMemory,
}

impl ResultRetrievalTool {
    pub fn new(memory: ExecutionMemory) -> Self {
        Self { memory }
    }

    fn tool_error(message: impl Into<String>) -> CrewError {
        CrewError::ToolExecution {
            tool: RETRIEVAL_TOOL_NAME.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Tool for ResultRetrievalTool {
    fn name(&self) -> &str {
        RETRIEVAL_TOOL_NAME
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: RETRIEVAL_TOOL_NAME.to_string(),
            description: "Read results produced by other agents in this run. Actions: \
                          list_agents, get_agent_result(agent_id), search_results(query, top_k)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["list_agents", "get_agent_result", "search_results"]
                    },
                    "agent_id": { "type": "string" },
                    "query": { "type": "string" },
                    "top_k": { "type": "integer", "minimum": 1 }
                },
                "required": ["action"]
            }),
        }
    }

    async fn call(&self, invocation: ToolInvocation, _ctx: &FlowContext) -> Result<Value> {
        let action = invocation
            .str_arg("action")
            .ok_or_else(|| Self::tool_error("missing `action` argument"))?;

        match action {
            "list_agents" => Ok(json!({ "agents": self.memory.agent_ids() })),
            "get_agent_result" => {
                let agent_id = invocation
                    .str_arg("agent_id")
                    .ok_or_else(|| Self::tool_error("missing `agent_id` argument"))?;
                match self.memory.get_results_by_agent(agent_id) {
                    Some(result) => Ok(json!({
                        "agent_id": result.agent_id,
                        "found": true,
                        "content": result.content,
                    })),
                    None => Ok(json!({ "agent_id": agent_id, "found": false })),
                }
            }
            "search_results" => {
                let query = invocation
                    .str_arg("query")
                    .ok_or_else(|| Self::tool_error("missing `query` argument"))?;
                let top_k = invocation
                    .input
                    .get("top_k")
                    .and_then(Value::as_u64)
                    .map(|k| k.max(1) as usize)
                    .unwrap_or(DEFAULT_TOP_K);
                let hits = self.memory.search_similar(query, top_k).await?;
                Ok(json!({
                    "matches": hits
                        .into_iter()
                        .map(|hit| json!({
                            "agent_id": hit.result.agent_id,
                            "chunk": hit.chunk,
                            "offset": hit.offset,
                            "score": hit.score,
                        }))
                        .collect::<Vec<_>>()
                }))
            }
            other => Err(Self::tool_error(format!("unknown action `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AgentResult;

    fn invocation(input: Value) -> ToolInvocation {
        ToolInvocation::new(RETRIEVAL_TOOL_NAME, input)
    }

    #[tokio::test]
    async fn lists_and_fetches_results() {
        let memory = ExecutionMemory::new("q");
        memory.record(AgentResult::new("researcher", "facts"));
        let tool = ResultRetrievalTool::new(memory);
        let ctx = FlowContext::new("q");

        let listed = tool
            .call(invocation(json!({ "action": "list_agents" })), &ctx)
            .await
            .unwrap();
        assert_eq!(listed["agents"], json!(["researcher"]));

        let fetched = tool
            .call(
                invocation(json!({ "action": "get_agent_result", "agent_id": "researcher" })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(fetched["content"], "facts");

        let missing = tool
            .call(
                invocation(json!({ "action": "get_agent_result", "agent_id": "ghost" })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(missing["found"], false);
    }

    #[tokio::test]
    async fn search_without_embedder_reports_not_configured() {
        let tool = ResultRetrievalTool::new(ExecutionMemory::new("q"));
        let err = tool
            .call(
                invocation(json!({ "action": "search_results", "query": "x" })),
                &FlowContext::new("q"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrewError::NotConfigured(_)));
    }
}
