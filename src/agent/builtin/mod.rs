use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::{
    Agent, AgentContext, AgentFactoryRegistry, AgentInput, AgentResponse, ToolCallRecord,
};
use crate::error::{CrewError, Result};
use crate::llm::{DynLlmClient, LlmMessage, LlmRequest, LocalEchoClient};
use crate::tools::ToolInvocation;
use crate::utils::validation::ConfigValidator;

/// 返回渲染后的输入，并以 agent 名称为前缀
pub struct EchoAgent {
    name: String,
}

impl EchoAgent {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: AgentInput, _ctx: &AgentContext<'_>) -> Result<AgentResponse> {
        Ok(AgentResponse::text(format!("[{}] {}", self.name, input.render())))
    }
}

type AgentFn = dyn Fn(AgentInput) -> Result<AgentResponse> + Send + Sync;

/// 闭包 agent
pub struct FnAgent {
    name: String,
    description: Option<String>,
    handler: Arc<AgentFn>,
}

impl FnAgent {
    pub fn new<T, F>(name: T, handler: F) -> Self
    where
        T: Into<String>,
        F: Fn(AgentInput) -> Result<AgentResponse> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn invoke(&self, input: AgentInput, _ctx: &AgentContext<'_>) -> Result<AgentResponse> {
        (self.handler)(input)
    }
}

const DEFAULT_TOOL_ROUNDS: u32 = 4;

/// LLM 驱动的 agent
pub struct LlmAgent {
    name: String,
    description: Option<String>,
    client: DynLlmClient,
    system_prompt: Option<String>,
    peer_context: bool,
    use_tools: bool,
    max_tool_rounds: u32,
    temperature: f32,
}

impl LlmAgent {
    pub fn new<T: Into<String>>(name: T, client: DynLlmClient) -> Self {
        Self {
            name: name.into(),
            description: None,
            client,
            system_prompt: None,
            peer_context: false,
            use_tools: false,
            max_tool_rounds: DEFAULT_TOOL_ROUNDS,
            temperature: 0.2,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 将执行记忆中其他 agent 的最新结果追加到 prompt
    pub fn with_peer_context(mut self, enabled: bool) -> Self {
        self.peer_context = enabled;
        self
    }

    /// 向模型提供运行时工具（包括结果检索）
    pub fn with_tools(mut self, enabled: bool) -> Self {
        self.use_tools = enabled;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn prompt(&self, input: &AgentInput, ctx: &AgentContext<'_>) -> String {
        let mut prompt = input.render();
        if self.peer_context {
            let peers = ctx.peer_context(&self.name);
            if !peers.is_empty() {
                prompt.push_str("\n\nResults from other agents:\n");
                prompt.push_str(&peers);
            }
        }
        prompt
    }
}

#[async_trait]
impl Agent for LlmAgent {
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
        let mut messages = vec![LlmMessage::user(self.prompt(&input, ctx))];
        let tools = if self.use_tools {
            ctx.runtime.tools()
        } else {
            Vec::new()
        };
        let mut records = Vec::new();

        for round in 0..self.max_tool_rounds {
            let mut request = LlmRequest::new(messages.clone())
                .with_tools(tools.clone())
                .with_response_schema(input.output_schema.clone())
                .with_temperature(self.temperature);
            if let Some(system) = &self.system_prompt {
                request = request.with_system(system.clone());
            }

            let reply = self
                .client
                .complete(request)
                .await
                .map_err(|err| CrewError::invocation(&self.name, err))?;

            if reply.tool_calls.is_empty() || tools.is_empty() {
                let mut response = AgentResponse::text(reply.content.clone());
                response.tool_calls = records;
                if let Some(model) = reply.model.or_else(|| self.client.model().map(str::to_string)) {
                    response = response.with_model(model);
                }
                if input.output_schema.is_some() {
                    match serde_json::from_str::<Value>(reply.content.trim()) {
                        Ok(value) => response = response.with_structured(value),
                        Err(err) => debug!(agent = %self.name, %err, "structured output is not JSON"),
                    }
                }
                return Ok(response);
            }

            debug!(agent = %self.name, round, calls = reply.tool_calls.len(), "model requested tools");
            messages.push(LlmMessage::assistant(reply.content, reply.tool_calls.clone()));
            for call in reply.tool_calls {
                let invocation = ToolInvocation::new(&call.name, call.arguments.clone());
                let (content, record) = match ctx.runtime.call_tool(&call.name, invocation).await {
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
                        warn!(agent = %self.name, tool = %call.name, %err, "tool call failed");
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

        Err(CrewError::invocation(
            &self.name,
            format!("tool loop did not finish within {} rounds", self.max_tool_rounds),
        ))
    }
}

fn extract_config<T: DeserializeOwned>(value: Option<Value>) -> Result<T> {
    let normalized = value.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(normalized)
        .map_err(|e| CrewError::InvalidConfiguration(format!("agent config: {e}")))
}

pub fn register_builtin_agent_factories(registry: &mut AgentFactoryRegistry) {
    registry.register_factory(
        "echo",
        Arc::new(|config| {
            #[derive(Deserialize)]
            struct Conf {
                name: String,
            }
            let conf: Conf = extract_config(config)?;
            Ok(Arc::new(EchoAgent::new(conf.name)) as Arc<dyn Agent>)
        }),
    );

    registry.register_factory(
        "llm",
        Arc::new(|config| {
            #[derive(Deserialize)]
            struct Conf {
                name: String,
                #[serde(default)]
                description: Option<String>,
                #[serde(default)]
                system_prompt: Option<String>,
                #[serde(default)]
                peer_context: bool,
                #[serde(default)]
                use_tools: bool,
                #[serde(default)]
                temperature: Option<f32>,
            }
            let conf: Conf = extract_config(config)?;
            let mut agent = LlmAgent::new(conf.name, Arc::new(LocalEchoClient))
                .with_peer_context(conf.peer_context)
                .with_tools(conf.use_tools);
            if let Some(temperature) = conf.temperature {
                ConfigValidator::validate_temperature(temperature)?;
                agent = agent.with_temperature(temperature);
            }
            if let Some(description) = conf.description {
                agent = agent.with_description(description);
            }
            if let Some(prompt) = conf.system_prompt {
                agent = agent.with_system_prompt(prompt);
            }
            Ok(Arc::new(agent) as Arc<dyn Agent>)
        }),
    );
}
