use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use agentcrew::{
    Agent, AgentContext, AgentCrew, AgentInput, AgentResponse, AgentTask, CrewError, CrewMode,
    CrewStatus, ExecutionStatus, FlowContext, FnAgent,
};

/// 记录收到的每个输入；可选延迟或失败
struct RecorderAgent {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    delay_ms: u64,
    fail: bool,
}

impl RecorderAgent {
    fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            log,
            delay_ms: 0,
            fail: false,
        }
    }

    fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait::async_trait]
impl Agent for RecorderAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(
        &self,
        input: AgentInput,
        _ctx: &AgentContext<'_>,
    ) -> agentcrew::Result<AgentResponse> {
        if self.delay_ms > 0 {
            sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.log.lock().push(format!("{}:{}", self.name, input.render()));
        if self.fail {
            return Err(CrewError::invocation(self.name, "model unavailable"));
        }
        let upstream: Vec<String> = input.upstream.iter().map(|u| u.agent.clone()).collect();
        Ok(AgentResponse::text(format!(
            "{} done (after {})",
            self.name,
            upstream.join("+")
        )))
    }
}

fn invariants(result: &agentcrew::CrewResult) {
    assert_eq!(result.execution_order.len(), result.agents.len());
    assert_eq!(result.status == CrewStatus::Completed, result.errors.is_empty());
    assert_eq!(result.success, result.errors.is_empty());
}

#[tokio::test]
async fn sequential_chain_stops_at_first_failure() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("pipeline");
    crew.add_agent(Arc::new(RecorderAgent::new("a", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("b", log.clone()).failing()))?;
    crew.add_agent(Arc::new(RecorderAgent::new("c", log.clone())))?;

    let result = crew.run(CrewMode::Sequential { pass_full_context: false }, "start").await?;

    invariants(&result);
    assert_eq!(result.status, CrewStatus::Failed);
    assert_eq!(result.execution_order, vec!["a", "b"]);
    assert_eq!(result.skipped, vec!["c"]);
    assert!(result.errors["b"].contains("model unavailable"));
    assert_eq!(result.output, "a done (after )");
    assert!(log.lock().iter().all(|line| !line.starts_with("c:")));
    assert!(log.lock()[1].starts_with("b:a done"));
    Ok(())
}

#[tokio::test]
async fn sequential_full_context_hands_every_prior_output() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("pipeline");
    for name in ["research", "draft", "edit"] {
        crew.add_agent(Arc::new(RecorderAgent::new(name, log.clone())))?;
    }

    let result = crew.run_sequential("topic", true).await?;

    invariants(&result);
    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(result.output, "edit done (after research+draft)");
    let seen = log.lock().clone();
    assert!(seen[2].starts_with("edit:topic"));
    Ok(())
}

#[tokio::test]
async fn parallel_failure_does_not_cancel_siblings() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("fanout");
    crew.add_agent(Arc::new(RecorderAgent::new("slow", log.clone()).with_delay(30)))?;
    crew.add_agent(Arc::new(RecorderAgent::new("broken", log.clone()).failing()))?;
    crew.add_agent(Arc::new(RecorderAgent::new("fast", log.clone())))?;

    let completed = Arc::new(Mutex::new(Vec::new()));
    let seen = completed.clone();
    crew.on_agent_complete(move |agent, info, _ctx| {
        seen.lock().push((agent.to_string(), info.status));
        Ok(())
    });

    let result = crew.run(CrewMode::Parallel, "same question").await?;

    invariants(&result);
    assert_eq!(result.status, CrewStatus::Partial);
    assert_eq!(result.agents.len(), 3);
    assert_eq!(result.execution_order.last().map(String::as_str), Some("slow"));
    assert_eq!(result.agent_results.len(), 2);
    assert!(result.errors.contains_key("broken"));
    assert_eq!(result.output, "[slow]: slow done (after )\n\n[fast]: fast done (after )");
    assert!(completed
        .lock()
        .contains(&("broken".to_string(), ExecutionStatus::Failed)));
    Ok(())
}

#[tokio::test]
async fn parallel_tasks_can_carry_their_own_queries() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("fanout");
    crew.add_agent(Arc::new(RecorderAgent::new("x", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("y", log.clone())))?;

    let result = crew
        .run_parallel(vec![AgentTask::new("x", "first"), AgentTask::new("y", "second")])
        .await?;

    assert_eq!(result.status, CrewStatus::Completed);
    let mut seen = log.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["x:first", "y:second"]);
    Ok(())
}

#[tokio::test]
async fn dag_writer_editors_final_reviewer() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("editorial");
    crew.add_agent(Arc::new(RecorderAgent::new("writer", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("editor1", log.clone()).with_delay(20)))?;
    crew.add_agent(Arc::new(RecorderAgent::new("editor2", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("final_reviewer", log.clone())))?;
    crew.task_flow("writer", ["editor1", "editor2"]);
    crew.task_flow("editor1", ["final_reviewer"]);
    crew.task_flow("editor2", ["final_reviewer"]);

    let result = crew.run(CrewMode::Flow, "write an article").await?;

    invariants(&result);
    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(result.execution_order.first().map(String::as_str), Some("writer"));
    assert_eq!(
        result.execution_order.last().map(String::as_str),
        Some("final_reviewer")
    );
    assert_eq!(result.output, "final_reviewer done (after editor1+editor2)");

    let snapshot = &result.metadata["execution_memory"];
    assert_eq!(snapshot["total_executions"], 4);
    assert_eq!(snapshot["execution_graph"]["edges"].as_array().map(Vec::len), Some(4));
    Ok(())
}

#[tokio::test]
async fn dag_failure_skips_dependents_only() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("editorial");
    crew.add_agent(Arc::new(RecorderAgent::new("writer", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("editor1", log.clone()).failing()))?;
    crew.add_agent(Arc::new(RecorderAgent::new("editor2", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("final_reviewer", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("fact_checker", log.clone())))?;
    crew.task_flow("writer", ["editor1", "editor2", "fact_checker"]);
    crew.task_flow("editor1", ["final_reviewer"]);
    crew.task_flow("editor2", ["final_reviewer"]);

    let result = crew.run_flow("write").await?;

    invariants(&result);
    assert_eq!(result.status, CrewStatus::Partial);
    assert_eq!(result.skipped, vec!["final_reviewer"]);
    assert!(result.agent_results.contains_key("fact_checker"));
    assert_eq!(result.output, "fact_checker done (after writer)");
    Ok(())
}

#[tokio::test]
async fn cycles_are_rejected_before_any_agent_runs() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("loop");
    for name in ["a", "b", "c"] {
        crew.add_agent(Arc::new(RecorderAgent::new(name, log.clone())))?;
    }
    crew.task_flow("a", ["b"]);
    crew.task_flow("b", ["c"]);
    crew.task_flow("c", ["a"]);

    let err = crew.run_flow("go").await.unwrap_err();
    match err {
        CrewError::CycleDetected(path) => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(log.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn memory_resets_between_runs_unless_kept() -> anyhow::Result<()> {
    let echo = || -> Arc<dyn Agent> {
        Arc::new(FnAgent::new("echo", |input: AgentInput| {
            Ok(AgentResponse::text(input.query))
        }))
    };

    let mut crew = AgentCrew::new("fresh");
    crew.add_agent(echo())?;
    crew.run(CrewMode::Parallel, "one").await?;
    crew.run(CrewMode::Parallel, "two").await?;
    assert_eq!(crew.memory().total_executions(), 1);
    assert_eq!(crew.memory().original_query(), "two");

    let mut crew = AgentCrew::new("kept").keep_memory_between_runs(true);
    crew.add_agent(echo())?;
    crew.run(CrewMode::Parallel, "one").await?;
    crew.run(CrewMode::Parallel, "two").await?;
    assert_eq!(crew.memory().total_executions(), 2);
    assert_eq!(crew.memory().reexecutions(), 1);
    assert_eq!(crew.memory().execution_order(), vec!["echo"]);
    assert_eq!(crew.memory().get_results_by_agent("echo").map(|r| r.content), Some("two".to_string()));
    Ok(())
}

#[tokio::test]
async fn base_context_identity_and_shared_data_flow_into_runs() -> anyhow::Result<()> {
    let base = FlowContext::new("ignored")
        .with_user("u-1")
        .with_session("s-1")
        .with_shared("tone", serde_json::json!("formal"));
    let mut crew = AgentCrew::new("ctx").with_context(base);
    crew.add_agent(Arc::new(FnAgent::new("tagger", |_input: AgentInput| {
        Ok(AgentResponse::text("tagged").with_shared("tagged", serde_json::json!(true)))
    })))?;

    let seen = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    crew.on_agent_complete(move |_agent, _info, ctx| {
        *capture.lock() = Some((ctx.user_id().map(str::to_string), ctx.original_query().to_string()));
        Ok(())
    });
    let result = crew.run(CrewMode::Parallel, "real query").await?;

    assert_eq!(
        seen.lock().clone(),
        Some((Some("u-1".to_string()), "real query".to_string()))
    );
    assert_eq!(result.metadata["shared_data"]["tone"], "formal");
    assert_eq!(result.metadata["shared_data"]["tagged"], true);
    Ok(())
}

#[tokio::test]
async fn concurrent_runs_on_one_crew_do_not_share_memory() -> anyhow::Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut crew = AgentCrew::new("shared");
    crew.add_agent(Arc::new(RecorderAgent::new("a", log.clone())))?;
    crew.add_agent(Arc::new(RecorderAgent::new("b", log.clone()).with_delay(150)))?;
    let crew = Arc::new(crew);

    let first = tokio::spawn({
        let crew = Arc::clone(&crew);
        async move { crew.run(CrewMode::Sequential { pass_full_context: false }, "one").await }
    });
    sleep(Duration::from_millis(40)).await;
    let second = crew.run(CrewMode::Sequential { pass_full_context: false }, "two").await?;
    let first = first.await??;

    for (result, query) in [(&first, "one"), (&second, "two")] {
        assert_eq!(result.status, CrewStatus::Completed);
        assert_eq!(result.execution_order, vec!["a", "b"]);
        let memory = &result.metadata["execution_memory"];
        assert_eq!(memory["original_query"], query);
        assert_eq!(memory["total_executions"], 2);
    }
    assert_eq!(crew.memory().original_query(), "two");
    Ok(())
}
