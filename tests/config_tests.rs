use std::sync::Arc;

use serde_json::json;

use agentcrew::agent::AgentFactoryRegistry;
use agentcrew::flow::CompletionPolicy;
use agentcrew::{
    AgentsFlow, CrewError, CrewStatus, EchoAgent, EngineConfig, JobStatus, JobTracker,
    WorkflowConfig,
};

fn release_workflow() -> serde_json::Value {
    json!({
        "name": "release-notes",
        "engine": { "max_retries": 1, "completion_policy": "reachable_terminals" },
        "agents": [
            { "name": "drafter", "kind": "echo" },
            { "name": "fixer", "kind": "echo", "can_retry": false },
            { "name": "reviewer", "kind": "echo" },
            { "name": "publisher", "kind": "llm", "temperature": 0.2, "description": "Publishes the note" },
            { "name": "archiver", "kind": "echo" }
        ],
        "edges": [
            { "type": "success", "from": "drafter", "to": "reviewer" },
            { "type": "error", "from": "drafter", "to": "fixer", "instruction": "Repair the draft" },
            { "type": "success", "from": "fixer", "to": "drafter" },
            {
                "type": "condition", "from": "reviewer", "to": "publisher",
                "condition": { "type": "output_contains", "value": "[reviewer]" }
            },
            {
                "type": "condition", "from": "reviewer", "to": "archiver", "name": "rejected",
                "condition": { "type": "output_contains", "value": "rejected" }
            }
        ]
    })
}

#[tokio::test]
async fn workflow_file_builds_and_runs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("release.json");
    std::fs::write(&path, serde_json::to_string_pretty(&release_workflow())?)?;

    let config = WorkflowConfig::from_file(&path)?;
    assert_eq!(config.engine.max_retries, 1);
    assert_eq!(config.engine.completion_policy, CompletionPolicy::ReachableTerminals);

    let flow = config.build_flow(&AgentFactoryRegistry::with_builtins())?;
    assert_eq!(flow.name(), "release-notes");
    assert_eq!(flow.transitions().len(), 5);

    let plan = flow.validate_workflow()?;
    let plan = serde_json::to_value(&plan)?;
    assert_eq!(plan["entry_nodes"], json!(["drafter"]));

    let result = flow.run_flow("draft the launch note").await?;
    assert_eq!(result.status, CrewStatus::Completed);
    assert!(result.output.starts_with("[Echo]"));
    assert_eq!(result.execution_order, vec!["drafter", "reviewer", "publisher"]);
    assert_eq!(result.metadata["node_states"]["publisher"], "completed");
    assert_eq!(result.metadata["node_states"]["archiver"], "skipped(condition_not_met)");
    assert_eq!(result.metadata["completion_policy"], "reachable_terminals");
    assert_eq!(result.agent("publisher").and_then(|a| a.model.as_deref()), Some("local-echo"));
    Ok(())
}

#[test]
fn workflow_validation_rejects_bad_definitions() {
    let mut unnamed = release_workflow();
    unnamed["name"] = json!("   ");
    assert!(matches!(
        WorkflowConfig::from_json(&unnamed.to_string()),
        Err(CrewError::InvalidConfiguration(_))
    ));

    let mut duplicated = release_workflow();
    duplicated["agents"][4]["name"] = json!("drafter");
    assert!(matches!(
        WorkflowConfig::from_json(&duplicated.to_string()),
        Err(CrewError::DuplicateAgent(name)) if name == "drafter"
    ));

    let mut unknown_kind = release_workflow();
    unknown_kind["agents"][0]["kind"] = json!("telepathy");
    let config = WorkflowConfig::from_json(&unknown_kind.to_string()).expect("names are valid");
    assert!(matches!(
        config.build_flow(&AgentFactoryRegistry::with_builtins()),
        Err(CrewError::InvalidConfiguration(message)) if message.contains("telepathy")
    ));

    let lonely_ballot = json!({
        "name": "gate",
        "decisions": [{ "name": "vote", "mode": "ballot", "agents": [{ "name": "solo", "kind": "echo" }] }]
    });
    let config = WorkflowConfig::from_json(&lonely_ballot.to_string()).expect("names are valid");
    assert!(matches!(
        config.build_flow(&AgentFactoryRegistry::with_builtins()),
        Err(CrewError::InvalidConfiguration(_))
    ));

    assert!(matches!(
        WorkflowConfig::from_json("{ not json"),
        Err(CrewError::InvalidConfiguration(_))
    ));
}

#[test]
fn engine_config_reads_files_and_rejects_zero_limits() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "max_iterations": 12, "vectorize_results": true }"#)?;

    let config = EngineConfig::from_file(&path)?;
    assert_eq!(config.max_iterations, 12);
    assert!(config.vectorize_results);
    assert_eq!(config.max_concurrency, EngineConfig::default().max_concurrency);
    assert_eq!(config.completion_policy, CompletionPolicy::AllTerminals);

    std::fs::write(&path, r#"{ "max_concurrency": 0 }"#)?;
    assert!(matches!(
        EngineConfig::from_file(&path),
        Err(CrewError::InvalidConfiguration(_))
    ));
    assert!(EngineConfig::from_file(dir.path().join("missing.json")).is_err());
    Ok(())
}

#[tokio::test]
async fn jobs_track_flow_runs_to_completion() -> anyhow::Result<()> {
    let mut flow = AgentsFlow::new("pipeline");
    flow.add_agent(Arc::new(EchoAgent::new("first")))?;
    flow.add_agent(Arc::new(EchoAgent::new("second")))?;
    flow.task_flow("first", ["second"]);

    let mut broken = AgentsFlow::new("broken");
    broken.add_agent(Arc::new(EchoAgent::new("first")))?;
    broken.task_flow("first", ["nowhere"]);

    let jobs = JobTracker::default();
    let ok = jobs.submit_flow(Arc::new(flow), "hello").await?;
    let bad = jobs.submit_flow(Arc::new(broken), "hello").await?;

    let done = jobs.wait(&ok).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.name, "pipeline");
    let result = done.result.expect("completed jobs keep their result");
    assert_eq!(result.execution_order, vec!["first", "second"]);
    assert!(result.output.starts_with("[second]"));
    assert!(done.started_at.is_some() && done.finished_at.is_some());

    let failed = jobs.wait(&bad).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("nowhere")));
    assert!(failed.result.is_none());

    let listed = jobs.list().await?;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|job| job.status.is_final()));
    assert!(jobs.status("no-such-job").await?.is_none());
    Ok(())
}
