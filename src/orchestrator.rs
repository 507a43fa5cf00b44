// 协调者 agent：把专家 agent 暴露成工具，交给一个 LLM 调度

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentInput, AgentRegistry, AgentResponse, ToolCallRecord};
use crate::crew::{AgentExecutionInfo, CrewResult, CrewStatus, ResultCollector};
use crate::error::{CrewError, Result};
use crate::llm::{DynLlmClient, LlmMessage, LlmRequest};
use crate::memory::ExecutionMemory;
use crate::runtime::AgentInvoker;
use crate::state::FlowContext;
use crate::tools::{Tool, ToolInvocation, ToolRegistry, ToolSpec};

const DEFAULT_MAX_TURNS: u32 = 6;
const DEFAULT_SYSTEM_PROMPT: &str = "You coordinate a team of specialists. Call a specialist tool with a `query` when its expertise is needed, then give the final answer.";

/// 把一个专家 agent 包装成工具，每次调用恰好执行一次该 agent
pub struct AgentTool {
    agent: String,
    description: String,
    invoker: AgentInvoker,
    executions: Arc<Mutex<Vec<AgentExecutionInfo>>>,
}

impl AgentTool {
    pub fn new(agent: &dyn Agent, invoker: AgentInvoker) -> Self {
        Self {
            agent: agent.name().to_string(),
            description: agent
                .description()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Delegate a task to the `{}` specialist.", agent.name())),
            invoker,
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recording(mut self, executions: Arc<Mutex<Vec<AgentExecutionInfo>>>) -> Self {
        self.executions = executions;
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.agent
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.agent.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Task for the specialist" }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, invocation: ToolInvocation, _ctx: &FlowContext) -> Result<Value> {
        let query = invocation
            .str_arg("query")
            .ok_or_else(|| CrewError::ToolExecution {
                tool: self.agent.clone(),
                message: "missing string argument `query`".to_string(),
            })?
            .to_string();
        let invocation = self.invoker.invoke(&self.agent, AgentInput::new(query)).await;
        self.executions.lock().push(invocation.info);
        let response = invocation.result?;
        Ok(json!({ "agent": self.agent, "output": response.output }))
    }
}

/// LLM 协调者
pub struct OrchestratorAgent {
    name: String,
    description: Option<String>,
    client: DynLlmClient,
    system_prompt: String,
    specialists: AgentRegistry,
    tools: ToolRegistry,
    max_turns: u32,
    temperature: f32,
}

struct Coordination {
    response: AgentResponse,
    executions: Vec<AgentExecutionInfo>,
    turns: u32,
}

impl OrchestratorAgent {
    pub fn new(name: impl Into<String>, client: DynLlmClient) -> Self {
        Self {
            name: name.into(),
            description: None,
            client,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            specialists: AgentRegistry::new(),
            tools: ToolRegistry::new(),
            max_turns: DEFAULT_MAX_TURNS,
            temperature: 0.2,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// 专家 agent 自身可用的工具
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        if agent.name() == self.name {
            return Err(CrewError::DuplicateAgent(self.name.clone()));
        }
        self.specialists.register(agent)
    }

    pub fn specialists(&self) -> &[String] {
        self.specialists.names()
    }

    /// 以 `query` 运行协调者，并像 crew 运行一样记录每次委派
    pub async fn run(&self, query: &str) -> Result<CrewResult> {
        let ctx = FlowContext::new(query);
        let memory = ExecutionMemory::new(query);
        info!(orchestrator = %self.name, specialists = self.specialists.len(), "orchestration started");
        let coordination = self
            .coordinate(AgentInput::new(query), ctx.clone(), memory.clone())
            .await?;

        let mut collector = ResultCollector::start();
        for execution in coordination.executions {
            collector.push(execution);
        }
        let status = CrewStatus::from_outcome(collector.has_errors(), true);

        let mut metadata = Map::new();
        metadata.insert("orchestrator".to_string(), Value::String(self.name.clone()));
        metadata.insert("turns".to_string(), Value::from(coordination.turns));
        metadata.insert(
            "execution_memory".to_string(),
            serde_json::to_value(memory.get_snapshot())?,
        );
        metadata.insert(
            "shared_data".to_string(),
            Value::Object(ctx.snapshot().shared_data),
        );
        let result = collector.finish(coordination.response.output, status, metadata);
        info!(orchestrator = %self.name, status = ?result.status, delegations = result.agents.len(), "orchestration finished");
        Ok(result)
    }

    async fn coordinate(
        &self,
        input: AgentInput,
        ctx: FlowContext,
        memory: ExecutionMemory,
    ) -> Result<Coordination> {
        let invoker = AgentInvoker::new(
            Arc::new(self.specialists.clone()),
            &self.tools,
            memory,
            ctx.clone(),
        );
        let executions = Arc::new(Mutex::new(Vec::new()));
        let mut delegates = ToolRegistry::new();
        for (_, agent) in self.specialists.iter() {
            delegates.register(Arc::new(
                AgentTool::new(agent.as_ref(), invoker.clone()).recording(Arc::clone(&executions)),
            ));
        }
        let specs = delegates.specs();

        let mut messages = vec![LlmMessage::user(input.render())];
        let mut records = Vec::new();
        for turn in 1..=self.max_turns {
            let request = LlmRequest::new(messages.clone())
                .with_system(self.system_prompt.clone())
                .with_tools(specs.clone())
                .with_response_schema(input.output_schema.clone())
                .with_temperature(self.temperature);
            let reply = self
                .client
                .complete(request)
                .await
                .map_err(|err| CrewError::invocation(&self.name, err))?;

            if reply.tool_calls.is_empty() {
                let mut response = AgentResponse::text(reply.content)
                    .with_metadata("turns", Value::from(turn));
                response.tool_calls = records;
                if let Some(model) = reply.model.or_else(|| self.client.model().map(str::to_string)) {
                    response = response.with_model(model);
                }
                let executions = std::mem::take(&mut *executions.lock());
                return Ok(Coordination {
                    response,
                    executions,
                    turns: turn,
                });
            }

            debug!(orchestrator = %self.name, turn, calls = reply.tool_calls.len(), "delegating");
            messages.push(LlmMessage::assistant(reply.content, reply.tool_calls.clone()));
            for call in reply.tool_calls {
                let invocation = ToolInvocation::new(&call.name, call.arguments.clone());
                let outcome = delegates.call(invocation, &ctx).await;
                let (content, record) = match outcome {
                    Ok(value) => (
                        value.to_string(),
                        ToolCallRecord {
                            tool: call.name.clone(),
                            arguments: call.arguments,
                            result: Some(value),
                            error: None,
                        },
                    ),
                    Err(err) => {
                        warn!(orchestrator = %self.name, specialist = %call.name, error = %err, "delegation failed");
                        (
                            format!("error: {err}"),
                            ToolCallRecord {
                                tool: call.name.clone(),
                                arguments: call.arguments,
                                result: None,
                                error: Some(err.to_string()),
                            },
                        )
                    }
                };
                records.push(record);
                messages.push(LlmMessage::tool(call.id, content));
            }
        }

        Err(CrewError::MaxIterationsExceeded(self.max_turns))
    }
}

#[async_trait]
impl Agent for OrchestratorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn model(&self) -> Option<&str> {
        self.client.model()
    }

    async fn invoke(&self, input: AgentInput, ctx: &AgentContext<'_>) -> Result<AgentResponse> {
        let query = input.query.clone();
        let coordination = self
            .coordinate(input, ctx.flow().fork(query.clone()), ExecutionMemory::new(query))
            .await?;
        let delegated: Vec<Value> = coordination
            .executions
            .iter()
            .map(|execution| Value::String(execution.agent_id.clone()))
            .collect();
        Ok(coordination
            .response
            .with_metadata("delegated", Value::Array(delegated)))
    }
}
