use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::agent::{AgentContext, AgentInput, AgentRegistry, AgentResponse};
use crate::crew::AgentExecutionInfo;
use crate::error::{CrewError, Result};
use crate::memory::{AgentResult, ExecutionMemory};
use crate::state::FlowContext;
use crate::tools::{ResultRetrievalTool, ToolRegistry};

use super::runtime::ExecutorRuntime;

/// 一次 agent 调用的结果
pub struct Invocation {
    pub info: AgentExecutionInfo,
    pub result: Result<AgentResponse>,
}

impl Invocation {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn output(&self) -> Option<&str> {
        self.result.as_ref().ok().map(|response| response.output.as_str())
    }
}

/// 引擎共用的 agent 调用器
///
/// 成功的结果在这里写入 FlowContext 和 ExecutionMemory，agent 本身不直接写。
#[derive(Clone)]
pub struct AgentInvoker {
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    memory: ExecutionMemory,
    ctx: FlowContext,
    vectorize: bool,
}

impl AgentInvoker {
    pub fn new(
        agents: Arc<AgentRegistry>,
        extra_tools: &ToolRegistry,
        memory: ExecutionMemory,
        ctx: FlowContext,
    ) -> Self {
        let mut tools = extra_tools.clone();
        tools.register(Arc::new(ResultRetrievalTool::new(memory.clone())));
        Self {
            agents,
            tools: Arc::new(tools),
            memory,
            ctx,
            vectorize: false,
        }
    }

    pub fn with_vectorize(mut self, vectorize: bool) -> Self {
        self.vectorize = vectorize;
        self
    }

    pub fn context(&self) -> &FlowContext {
        &self.ctx
    }

    pub fn memory(&self) -> &ExecutionMemory {
        &self.memory
    }

    pub async fn invoke(&self, agent_id: &str, input: AgentInput) -> Invocation {
        let mut info = AgentExecutionInfo::new(agent_id, input.render());
        info.mark_running();

        let agent = match self.agents.require(agent_id) {
            Ok(agent) => agent,
            Err(err) => {
                info.finish_failure(err.to_string(), 0.0);
                return Invocation {
                    info,
                    result: Err(err),
                };
            }
        };
        info.agent_name = agent.name().to_string();
        info.model = agent.model().map(str::to_string);
        if input.attempt > 0 {
            info.metadata
                .insert("attempt".to_string(), Value::from(input.attempt));
        }

        let runtime = ExecutorRuntime {
            ctx: self.ctx.clone(),
            tools: Arc::clone(&self.tools),
        };
        let agent_ctx = AgentContext {
            flow_ctx: &self.ctx,
            memory: &self.memory,
            runtime: &runtime,
        };

        let span = info_span!("agent", agent = %agent_id, attempt = input.attempt);
        let started = Instant::now();
        let result = match AssertUnwindSafe(agent.invoke(input, &agent_ctx))
            .catch_unwind()
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CrewError::invocation(agent_id, "agent panicked")),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                debug!(agent = %agent_id, elapsed, "agent completed");
                info.finish_success(&response, elapsed);
                self.commit(agent_id, &info, &response).await;
                Invocation {
                    info,
                    result: Ok(response),
                }
            }
            Err(err) => {
                let err = match err {
                    err @ CrewError::AgentInvocation { .. } => err,
                    other => CrewError::invocation(agent_id, other),
                };
                warn!(agent = %agent_id, error = %err, "agent failed");
                info.finish_failure(err.to_string(), elapsed);
                Invocation {
                    info,
                    result: Err(err),
                }
            }
        }
    }

    async fn commit(&self, agent_id: &str, info: &AgentExecutionInfo, response: &AgentResponse) {
        self.ctx.record_result(agent_id, response.output.clone());
        self.ctx.merge_shared(&response.shared_updates);

        let mut result = AgentResult::new(agent_id, response.output.clone())
            .with_name(info.agent_name.clone())
            .with_execution_time(info.execution_time);
        result.metadata = response.metadata.clone();
        if let Some(model) = &info.model {
            result
                .metadata
                .insert("model".to_string(), Value::String(model.clone()));
        }
        self.memory.add_result(result, self.vectorize).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EchoAgent, FnAgent};
    use crate::crew::ExecutionStatus;
    use serde_json::json;

    fn invoker(registry: AgentRegistry) -> AgentInvoker {
        AgentInvoker::new(
            Arc::new(registry),
            &ToolRegistry::new(),
            ExecutionMemory::new("q"),
            FlowContext::new("q"),
        )
    }

    #[tokio::test]
    async fn success_is_committed_to_memory_and_context() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Arc::new(FnAgent::new("tagger", |input: AgentInput| {
                Ok(AgentResponse::text(format!("tagged {}", input.query))
                    .with_shared("tagged", json!(true)))
            })))
            .unwrap();
        let invoker = invoker(registry);

        let invocation = invoker.invoke("tagger", AgentInput::new("doc")).await;
        assert!(invocation.is_success());
        assert_eq!(invocation.info.status, ExecutionStatus::Completed);
        assert_eq!(invoker.context().agent_result("tagger").as_deref(), Some("tagged doc"));
        assert_eq!(invoker.context().shared("tagged"), Some(json!(true)));
        assert_eq!(invoker.memory().get_results_by_agent("tagger").unwrap().content, "tagged doc");
    }

    #[tokio::test]
    async fn failures_are_wrapped_and_not_recorded() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Arc::new(FnAgent::new("broken", |_input: AgentInput| {
                Err(CrewError::Context("no data".into()))
            })))
            .unwrap();
        registry.register(Arc::new(EchoAgent::new("echo"))).unwrap();
        let invoker = invoker(registry);

        let invocation = invoker.invoke("broken", AgentInput::new("q")).await;
        assert!(matches!(
            invocation.result,
            Err(CrewError::AgentInvocation { ref agent, .. }) if agent == "broken"
        ));
        assert_eq!(invocation.info.status, ExecutionStatus::Failed);
        assert!(invoker.memory().is_empty());

        let missing = invoker.invoke("ghost", AgentInput::new("q")).await;
        assert!(matches!(missing.result, Err(CrewError::AgentNotRegistered(_))));
    }
}
