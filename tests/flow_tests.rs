use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use agentcrew::{
    condition_decision_equals, condition_output_contains, condition_state_equals, Agent,
    AgentContext, AgentInput, AgentResponse, AgentsFlow, CompletionPolicy, CrewError, CrewStatus,
    DecisionFlowNode, FnAgent, NodeOptions,
};

type Inputs = Arc<Mutex<Vec<(String, AgentInput)>>>;

/// 返回 `output` 并保存收到的每个输入的 agent
fn recording(name: &'static str, output: &'static str, inputs: &Inputs) -> Arc<dyn Agent> {
    let inputs = inputs.clone();
    Arc::new(FnAgent::new(name, move |input: AgentInput| {
        inputs.lock().push((name.to_string(), input));
        Ok(AgentResponse::text(output))
    }))
}

/// 前 `failures` 次调用失败，之后返回 `output`
fn flaky(name: &'static str, failures: u32, output: &'static str, inputs: &Inputs) -> Arc<dyn Agent> {
    let inputs = inputs.clone();
    let calls = AtomicU32::new(0);
    Arc::new(FnAgent::new(name, move |input: AgentInput| {
        inputs.lock().push((name.to_string(), input));
        if calls.fetch_add(1, Ordering::SeqCst) < failures {
            return Err(CrewError::invocation(name, "rate limited"));
        }
        Ok(AgentResponse::text(output))
    }))
}

fn inputs_of(inputs: &Inputs, agent: &str) -> Vec<AgentInput> {
    inputs
        .lock()
        .iter()
        .filter(|(name, _)| name == agent)
        .map(|(_, input)| input.clone())
        .collect()
}

#[tokio::test]
async fn error_handler_repairs_and_retries_the_failed_node() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let mut flow = AgentsFlow::new("publishing");
    flow.add_agent(flaky("writer", 1, "clean draft", &inputs))?;
    flow.add_agent(recording("fixer", "use the backup model", &inputs))?;
    flow.add_agent(recording("publisher", "published", &inputs))?;
    flow.task_flow("writer", ["publisher"]);
    flow.on_error("writer", "fixer", Some("diagnose the writer failure"));
    flow.task_flow("fixer", ["writer"]);

    let plan = flow.validate_workflow()?;
    assert_eq!(plan.entry_nodes, vec!["writer"]);
    assert_eq!(plan.terminal_nodes, vec!["publisher"]);
    assert!(plan.back_edges.contains(&("fixer".to_string(), "writer".to_string())));

    let result = flow.run_flow("write the release notes").await?;

    assert_eq!(result.status, CrewStatus::Completed);
    assert!(result.success);
    assert_eq!(result.execution_order, vec!["writer", "fixer", "writer", "publisher"]);
    assert_eq!(result.output, "published");
    assert!(result.errors.is_empty());
    assert!(result.metadata["recovered_errors"]["writer"]
        .as_str()
        .is_some_and(|error| error.contains("rate limited")));

    let fixer = inputs_of(&inputs, "fixer");
    assert_eq!(fixer.len(), 1);
    assert_eq!(fixer[0].instruction.as_deref(), Some("diagnose the writer failure"));
    assert!(fixer[0].error.as_deref().is_some_and(|e| e.contains("rate limited")));

    let writer = inputs_of(&inputs, "writer");
    assert_eq!(writer.len(), 2);
    assert_eq!(writer[0].attempt, 0);
    assert_eq!(writer[1].attempt, 1);
    assert_eq!(writer[1].upstream[0].agent, "fixer");
    assert_eq!(writer[1].upstream[0].output, "use the backup model");

    let publisher = inputs_of(&inputs, "publisher");
    assert_eq!(publisher[0].upstream[0].output, "clean draft");

    let memory = &result.metadata["execution_memory"];
    assert_eq!(memory["total_executions"], 3);
    assert_eq!(memory["reexecutions"], 0);
    Ok(())
}

#[tokio::test]
async fn node_without_handler_retries_itself_within_budget() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let mut flow = AgentsFlow::new("self-retry");
    flow.add_agent_with(
        flaky("fetcher", 2, "payload", &inputs),
        NodeOptions::default().with_max_retries(2),
    )?;
    flow.add_agent(recording("summarizer", "summary", &inputs))?;
    flow.task_flow("fetcher", ["summarizer"]);

    let result = flow.run_flow("fetch").await?;

    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(
        result.execution_order,
        vec!["fetcher", "fetcher", "fetcher", "summarizer"]
    );
    let attempts: Vec<u32> = inputs_of(&inputs, "fetcher").iter().map(|i| i.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert!(inputs_of(&inputs, "fetcher")[2]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("rate limited")));
    Ok(())
}

#[tokio::test]
async fn exhausted_failure_skips_downstream_and_fails_the_run() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let mut flow = AgentsFlow::new("broken");
    flow.add_agent_with(flaky("fetcher", 10, "never", &inputs), NodeOptions::no_retry())?;
    flow.add_agent(recording("summarizer", "summary", &inputs))?;
    flow.add_agent(recording("notifier", "sent", &inputs))?;
    flow.task_flow("fetcher", ["summarizer"]);
    flow.task_flow("summarizer", ["notifier"]);

    let result = flow.run_flow("fetch").await?;

    assert_eq!(result.status, CrewStatus::Failed);
    assert!(!result.success);
    assert_eq!(result.execution_order, vec!["fetcher"]);
    assert_eq!(result.skipped, vec!["summarizer", "notifier"]);
    assert_eq!(
        result.metadata["node_states"]["notifier"],
        "skipped(upstream_failed)"
    );
    assert!(inputs_of(&inputs, "summarizer").is_empty());
    Ok(())
}

#[tokio::test]
async fn reviewer_loop_revises_until_approved() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let reviews = AtomicU32::new(0);
    let review_log = inputs.clone();

    let mut flow = AgentsFlow::new("review-loop");
    flow.add_agent(recording("writer", "draft", &inputs))?;
    flow.add_agent(Arc::new(FnAgent::new("reviewer", move |input: AgentInput| {
        review_log.lock().push(("reviewer".to_string(), input));
        if reviews.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(AgentResponse::text("REVISE: tighten the intro"))
        } else {
            Ok(AgentResponse::text("APPROVED").with_shared("approved", json!(true)))
        }
    })))?;
    flow.add_agent(recording("publisher", "live", &inputs))?;
    flow.task_flow("writer", ["reviewer"]);
    flow.task_flow_if("reviewer", "writer", "needs_revision", condition_output_contains("REVISE"));
    flow.task_flow_if(
        "reviewer",
        "publisher",
        "approved",
        condition_state_equals("approved", json!(true)),
    );

    let plan = flow.validate_workflow()?;
    assert_eq!(plan.entry_nodes, vec!["writer"]);
    assert_eq!(plan.terminal_nodes, vec!["publisher"]);
    assert_eq!(plan.back_edges, vec![("reviewer".to_string(), "writer".to_string())]);

    let result = flow.run_flow("announce the launch").await?;

    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(
        result.execution_order,
        vec!["writer", "reviewer", "writer", "reviewer", "publisher"]
    );
    assert_eq!(result.output, "live");
    assert_eq!(result.metadata["iterations"], 5);
    assert!(result.skipped.is_empty());

    let writer = inputs_of(&inputs, "writer");
    assert!(writer[0].upstream.is_empty());
    assert_eq!(writer[1].upstream[0].agent, "reviewer");
    assert!(writer[1].upstream[0].output.starts_with("REVISE"));
    assert_eq!(flow.memory().reexecutions(), 2);
    Ok(())
}

#[tokio::test]
async fn looped_writer_is_an_entry_beside_an_independent_researcher() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let reviews = AtomicU32::new(0);
    let review_log = inputs.clone();

    let mut flow = AgentsFlow::new("two-entries");
    flow.add_agent(recording("researcher", "sources", &inputs))?;
    flow.add_agent(recording("writer", "draft", &inputs))?;
    flow.add_agent(Arc::new(FnAgent::new("reviewer", move |input: AgentInput| {
        review_log.lock().push(("reviewer".to_string(), input));
        if reviews.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(AgentResponse::text("REVISE"))
        } else {
            Ok(AgentResponse::text("APPROVED"))
        }
    })))?;
    flow.add_agent(recording("publisher", "live", &inputs))?;
    flow.task_flow("writer", ["reviewer"]);
    flow.task_flow("researcher", ["reviewer"]);
    flow.task_flow_if("reviewer", "writer", "revise", condition_output_contains("REVISE"));
    flow.task_flow_if("reviewer", "publisher", "approved", condition_output_contains("APPROVED"));

    let plan = flow.validate_workflow()?;
    assert_eq!(plan.entry_nodes, vec!["researcher", "writer"]);
    assert_eq!(plan.back_edges, vec![("reviewer".to_string(), "writer".to_string())]);

    let result = flow.run_flow("write the report").await?;

    assert_eq!(result.status, CrewStatus::Completed);
    assert!(result.skipped.is_empty());
    let mut first_two = result.execution_order[..2].to_vec();
    first_two.sort();
    assert_eq!(first_two, vec!["researcher", "writer"]);
    assert_eq!(result.execution_order[2..], ["reviewer", "writer", "reviewer", "publisher"]);

    let reviews = inputs_of(&inputs, "reviewer");
    let mut upstream: Vec<&str> = reviews[0].upstream.iter().map(|u| u.agent.as_str()).collect();
    upstream.sort();
    assert_eq!(upstream, vec!["researcher", "writer"]);
    assert_eq!(inputs_of(&inputs, "writer").len(), 2);
    Ok(())
}

#[tokio::test]
async fn endless_loop_hits_the_iteration_cap() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let mut flow = AgentsFlow::new("endless").with_max_iterations(4);
    flow.add_agent(recording("writer", "draft", &inputs))?;
    flow.add_agent(recording("reviewer", "REVISE again", &inputs))?;
    flow.task_flow("writer", ["reviewer"]);
    flow.task_flow_if("reviewer", "writer", "needs_revision", condition_output_contains("REVISE"));

    let err = flow.run_flow("write").await.unwrap_err();
    assert!(matches!(err, CrewError::MaxIterationsExceeded(4)));
    assert_eq!(inputs.lock().len(), 4);
    Ok(())
}

#[tokio::test]
async fn untaken_branch_policy_decides_between_stall_and_success() -> anyhow::Result<()> {
    let build = |policy: CompletionPolicy| -> anyhow::Result<AgentsFlow> {
        let inputs: Inputs = Arc::default();
        let mut flow = AgentsFlow::new("triage").with_completion_policy(policy);
        flow.add_agent(recording("triage", "bug report", &inputs))?;
        flow.add_agent(recording("bug_fixer", "patched", &inputs))?;
        flow.add_agent(recording("feature_planner", "planned", &inputs))?;
        flow.task_flow_if("triage", "bug_fixer", "bug", condition_output_contains("bug"));
        flow.task_flow_if(
            "triage",
            "feature_planner",
            "feature",
            condition_output_contains("feature"),
        );
        Ok(flow)
    };

    let strict = build(CompletionPolicy::AllTerminals)?;
    match strict.run_flow("ticket 42").await {
        Err(CrewError::WorkflowStalled { skipped, .. }) => {
            assert_eq!(skipped, vec!["feature_planner"]);
        }
        other => panic!("expected a stall, got {:?}", other.map(|r| r.status)),
    }

    let lenient = build(CompletionPolicy::ReachableTerminals)?;
    let result = lenient.run_flow("ticket 42").await?;
    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(result.output, "patched");
    assert_eq!(result.skipped, vec!["feature_planner"]);
    Ok(())
}

#[tokio::test]
async fn unknown_nodes_and_success_cycles_fail_validation() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let mut flow = AgentsFlow::new("bad");
    flow.add_agent(recording("a", "x", &inputs))?;
    flow.add_agent(recording("b", "y", &inputs))?;
    flow.task_flow("a", ["ghost"]);
    assert!(matches!(flow.validate_workflow(), Err(CrewError::UnknownNode(name)) if name == "ghost"));

    let mut flow = AgentsFlow::new("cycle");
    flow.add_agent(recording("a", "x", &inputs))?;
    flow.add_agent(recording("b", "y", &inputs))?;
    flow.task_flow("a", ["b"]);
    flow.task_flow("b", ["a"]);
    assert!(matches!(flow.run_flow("go").await, Err(CrewError::CycleDetected(_))));
    assert!(inputs.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn decision_node_routes_the_flow() -> anyhow::Result<()> {
    let inputs: Inputs = Arc::default();
    let voter = |name: &'static str, answer: &'static str| -> Arc<dyn Agent> {
        Arc::new(FnAgent::new(name, move |_input: AgentInput| {
            Ok(AgentResponse::text(answer))
        }))
    };
    let gate = DecisionFlowNode::ballot(
        "release_gate",
        [
            voter("qa", r#"{"decision": "ship", "confidence": 0.9}"#),
            voter("security", r#"{"decision": "ship", "confidence": 0.7}"#),
            voter("product", r#"{"decision": "hold", "confidence": 0.8}"#),
        ],
    )?;

    let mut flow = AgentsFlow::new("release").with_completion_policy(CompletionPolicy::ReachableTerminals);
    flow.add_agent(recording("builder", "build 1.4.0 ready", &inputs))?;
    flow.add_agent_with(Arc::new(gate), NodeOptions::no_retry())?;
    flow.add_agent(recording("deployer", "deployed", &inputs))?;
    flow.add_agent(recording("rollback", "rolled back", &inputs))?;
    flow.task_flow("builder", ["release_gate"]);
    flow.task_flow_if("release_gate", "deployer", "ship", condition_decision_equals("ship"));
    flow.task_flow_if("release_gate", "rollback", "hold", condition_decision_equals("hold"));

    let result = flow.run_flow("release 1.4.0?").await?;

    assert_eq!(result.status, CrewStatus::Completed);
    assert_eq!(result.execution_order, vec!["builder", "release_gate", "deployer"]);
    assert_eq!(result.agent_results["release_gate"], "ship");
    assert_eq!(result.skipped, vec!["rollback"]);
    assert_eq!(result.metadata["shared_data"]["release_gate_decision"], "ship");

    let gate = result.agent("release_gate").expect("gate ran");
    assert_eq!(gate.metadata["consensus_level"], "MAJORITY");
    assert_eq!(gate.metadata["mode"], "ballot");
    assert_eq!(gate.metadata["escalated"], false);

    // 投票者使用私有记忆运行
    assert_eq!(flow.memory().execution_order(), vec!["builder", "release_gate", "deployer"]);
    Ok(())
}

/// 可选延迟后返回 `<name>:<query>`
struct Tagger {
    name: &'static str,
    delay_ms: u64,
}

#[async_trait::async_trait]
impl Agent for Tagger {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(
        &self,
        input: AgentInput,
        _ctx: &AgentContext<'_>,
    ) -> agentcrew::Result<AgentResponse> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(AgentResponse::text(format!("{}:{}", self.name, input.query)))
    }
}

#[tokio::test]
async fn overlapping_runs_keep_separate_memories() -> anyhow::Result<()> {
    let mut flow = AgentsFlow::new("tagging");
    flow.add_agent(Arc::new(Tagger { name: "a", delay_ms: 0 }))?;
    flow.add_agent(Arc::new(Tagger { name: "b", delay_ms: 150 }))?;
    flow.task_flow("a", ["b"]);
    let flow = Arc::new(flow);

    let first = tokio::spawn({
        let flow = Arc::clone(&flow);
        async move { flow.run_flow("one").await }
    });
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = flow.run_flow("two").await?;
    let first = first.await??;

    for (result, query) in [(&first, "one"), (&second, "two")] {
        assert_eq!(result.status, CrewStatus::Completed);
        assert_eq!(result.execution_order, vec!["a", "b"]);
        assert_eq!(result.output, format!("b:{query}"));
        let memory = &result.metadata["execution_memory"];
        assert_eq!(memory["original_query"], query);
        assert_eq!(memory["total_executions"], 2);
        assert_eq!(memory["results"]["a"]["content"], format!("a:{query}"));
        assert_eq!(memory["results"]["b"]["content"], format!("b:{query}"));
    }
    assert_eq!(flow.memory().original_query(), "two");
    assert_eq!(flow.memory().total_executions(), 2);
    Ok(())
}
