use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentInput, AgentRegistry, AgentResponse};
use crate::config::EngineConfig;
use crate::crew::{CrewResult, CrewStatus, ResultCollector};
use crate::error::{CrewError, Result};
use crate::memory::{Embedder, ExecutionGraph, ExecutionMemory};
use crate::runtime::{AgentInvoker, Invocation};
use crate::state::FlowContext;
use crate::tools::ToolRegistry;

use super::conditions::TransitionCondition;
use super::fsm::{AgentNode, NodeState};
use super::topology::{FlowPlan, Topology};
use super::types::{CompletionPolicy, FlowTransition, NodeOptions, SkipReason, TransitionKind};

/// 带重试与错误处理路由的有限状态机工作流
pub struct AgentsFlow {
    name: String,
    agents: AgentRegistry,
    options: HashMap<String, NodeOptions>,
    transitions: Vec<FlowTransition>,
    entry: Option<String>,
    default_options: NodeOptions,
    policy: CompletionPolicy,
    max_iterations: u32,
    max_concurrency: usize,
    tools: ToolRegistry,
    /// 最近一次运行的记忆；除非设置 `keep_memory`，每次运行都从全新存储开始
    memory: Mutex<ExecutionMemory>,
    context: Option<FlowContext>,
    keep_memory: bool,
    vectorize: bool,
}

impl AgentsFlow {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, &EngineConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            name: name.into(),
            agents: AgentRegistry::new(),
            options: HashMap::new(),
            transitions: Vec::new(),
            entry: None,
            default_options: NodeOptions {
                can_retry: true,
                max_retries: config.max_retries,
            },
            policy: config.completion_policy,
            max_iterations: config.max_iterations.max(1),
            max_concurrency: config.max_concurrency.max(1),
            tools: ToolRegistry::new(),
            memory: Mutex::new(ExecutionMemory::default()),
            context: None,
            keep_memory: !config.reset_memory,
            vectorize: config.vectorize_results,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let options = self.default_options;
        self.add_agent_with(agent, options)
    }

    pub fn add_agent_with(&mut self, agent: Arc<dyn Agent>, options: NodeOptions) -> Result<()> {
        let name = agent.name().to_string();
        self.agents.register(agent)?;
        self.options.insert(name, options);
        Ok(())
    }

    pub fn task_flow<I, S>(&mut self, source: &str, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for target in targets {
            self.transitions.push(FlowTransition {
                from: source.to_string(),
                to: target.into(),
                kind: TransitionKind::OnSuccess,
            });
        }
    }

    pub fn task_flow_if(
        &mut self,
        source: &str,
        target: &str,
        name: impl Into<String>,
        condition: TransitionCondition,
    ) {
        self.transitions.push(FlowTransition {
            from: source.to_string(),
            to: target.to_string(),
            kind: TransitionKind::OnCondition {
                name: name.into(),
                condition,
            },
        });
    }

    /// 将 `source` 的失败路由到 `handler`。只有显式的
    /// `task_flow(handler, [source])` 边才会重试 source
    pub fn on_error(&mut self, source: &str, handler: &str, instruction: Option<&str>) {
        self.transitions.push(FlowTransition {
            from: source.to_string(),
            to: handler.to_string(),
            kind: TransitionKind::OnError {
                instruction: instruction.map(str::to_string),
            },
        });
    }

    pub fn set_entry(&mut self, name: impl Into<String>) {
        self.entry = Some(name.into());
    }

    pub fn with_completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools.extend(&tools);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        let memory = self.memory.get_mut();
        *memory = memory.clone().with_embedder(embedder);
        self.vectorize = true;
        self
    }

    pub fn with_context(mut self, context: FlowContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn keep_memory_between_runs(mut self, keep: bool) -> Self {
        self.keep_memory = keep;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn transitions(&self) -> &[FlowTransition] {
        &self.transitions
    }

    /// 最近一次运行的记忆句柄
    pub fn memory(&self) -> ExecutionMemory {
        self.memory.lock().clone()
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub fn validate_workflow(&self) -> Result<FlowPlan> {
        Ok(self.topology()?.plan(&self.transitions))
    }

    fn topology(&self) -> Result<Topology> {
        Topology::build(self.agents.names(), &self.transitions, self.entry.as_deref())
    }

    pub async fn run_flow(&self, initial_task: &str) -> Result<CrewResult> {
        let topology = self.topology()?;
        let (ctx, invoker) = self.prepare(initial_task);
        info!(flow = %self.name, entries = ?topology.entries, policy = ?self.policy, "running flow");

        let mut run = FlowRun::new(self, &topology, initial_task);
        for entry in &topology.entries {
            run.activate(entry)?;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(String, Invocation)> = JoinSet::new();

        loop {
            while let Some(name) = run.ready.pop_front() {
                if run.iterations >= self.max_iterations {
                    warn!(flow = %self.name, max = self.max_iterations, "iteration cap reached");
                    return Err(CrewError::MaxIterationsExceeded(self.max_iterations));
                }
                run.iterations += 1;
                let input = run.start(&name, &ctx)?;
                let invoker = invoker.clone();
                let semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let invocation = invoker.invoke(&name, input).await;
                    (name, invocation)
                });
            }

            match join_set.join_next().await {
                Some(Ok((name, invocation))) => run.finish(&name, invocation, &ctx)?,
                Some(Err(err)) => return Err(CrewError::Other(err.into())),
                None => {
                    if run.settle_waiting_failures() {
                        continue;
                    }
                    break;
                }
            }
        }

        if !run.is_complete(self.policy) {
            let (pending, skipped) = run.unfinished();
            warn!(flow = %self.name, ?pending, ?skipped, "flow stalled");
            return Err(CrewError::WorkflowStalled { pending, skipped });
        }
        Ok(run.into_result(&ctx, invoker.memory()))
    }

    fn prepare(&self, query: &str) -> (FlowContext, AgentInvoker) {
        let memory = {
            let mut last = self.memory.lock();
            if !self.keep_memory {
                *last = last.fresh(query);
            }
            last.clone()
        };
        memory.set_original_query(query);
        let mut graph = ExecutionGraph::new(self.agents.names().to_vec());
        for transition in &self.transitions {
            graph = graph.with_edge(
                transition.from.clone(),
                transition.to.clone(),
                transition.kind.label(),
            );
        }
        memory.set_execution_graph(graph);

        let ctx = match &self.context {
            Some(base) => base.fork(query),
            None => FlowContext::new(query),
        };
        let invoker = AgentInvoker::new(
            Arc::new(self.agents.clone()),
            &self.tools,
            memory,
            ctx.clone(),
        )
        .with_vectorize(self.vectorize);
        (ctx, invoker)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EdgeState {
    Unsettled,
    Fired,
    Dead(SkipReason),
}

struct HandlerInput {
    instruction: Option<String>,
    error: String,
}

/// 单次运行的调度状态
struct FlowRun<'a> {
    flow: &'a AgentsFlow,
    topology: &'a Topology,
    query: String,
    nodes: HashMap<String, AgentNode>,
    edges: Vec<EdgeState>,
    inbox: HashMap<String, Vec<String>>,
    handler_inputs: HashMap<String, HandlerInput>,
    ready: VecDeque<String>,
    collector: ResultCollector,
    recovered: Map<String, Value>,
    iterations: u32,
}

impl<'a> FlowRun<'a> {
    fn new(flow: &'a AgentsFlow, topology: &'a Topology, query: &str) -> Self {
        let nodes = flow
            .agents
            .names()
            .iter()
            .map(|name| {
                let options = flow.options.get(name).copied().unwrap_or(flow.default_options);
                (name.clone(), AgentNode::new(name.clone(), options))
            })
            .collect();
        Self {
            flow,
            topology,
            query: query.to_string(),
            nodes,
            edges: vec![EdgeState::Unsettled; flow.transitions.len()],
            inbox: HashMap::new(),
            handler_inputs: HashMap::new(),
            ready: VecDeque::new(),
            collector: ResultCollector::start(),
            recovered: Map::new(),
            iterations: 0,
        }
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut AgentNode> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| CrewError::UnknownNode(name.to_string()))
    }

    fn state(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(AgentNode::state)
    }

    /// 将节点置为 `Ready`；节点无法再次运行时返回 `false`
    fn activate(&mut self, name: &str) -> Result<bool> {
        let node = self.node_mut(name)?;
        match node.state() {
            NodeState::Pending | NodeState::Completed | NodeState::Skipped(_) => {
                node.transition(NodeState::Ready)?;
            }
            NodeState::Failed if node.can_retry() => {
                node.transition(NodeState::Ready)?;
                debug!(node = %name, retry = node.retries(), "retrying failed node");
            }
            NodeState::Failed => {
                debug!(node = %name, "retry budget exhausted, ignoring activation");
                return Ok(false);
            }
            NodeState::Ready | NodeState::Running => return Ok(false),
        }
        self.ready.push_back(name.to_string());
        Ok(true)
    }

    fn start(&mut self, name: &str, ctx: &FlowContext) -> Result<AgentInput> {
        let mut input = AgentInput::new(self.query.clone());
        let mut seen = Vec::new();
        for source in self.inbox.remove(name).unwrap_or_default() {
            if seen.contains(&source) {
                continue;
            }
            if let Some(output) = ctx.agent_result(&source) {
                input = input.with_upstream(source.clone(), output);
            }
            seen.push(source);
        }
        if let Some(handler) = self.handler_inputs.remove(name) {
            if let Some(instruction) = handler.instruction {
                input = input.with_instruction(instruction);
            }
            input = input.with_error(handler.error);
        }

        let node = self.node_mut(name)?;
        if node.retries() > 0 {
            if input.error.is_none() {
                if let Some(error) = node.last_error() {
                    input = input.with_error(error.to_string());
                }
            }
            input = input.with_attempt(node.retries());
        }
        node.transition(NodeState::Running)?;
        Ok(input)
    }

    fn finish(&mut self, name: &str, invocation: Invocation, ctx: &FlowContext) -> Result<()> {
        let Invocation { info, result } = invocation;
        self.collector.push(info);
        match result {
            Ok(response) => self.on_success(name, &response, ctx),
            Err(err) => self.on_failure(name, err.to_string()),
        }
    }

    fn on_success(&mut self, name: &str, response: &AgentResponse, ctx: &FlowContext) -> Result<()> {
        self.node_mut(name)?.transition(NodeState::Completed)?;
        if let Some(previous) = self.collector.recover(name) {
            debug!(node = %name, "failure recovered by retry");
            self.recovered.insert(name.to_string(), Value::String(previous));
        }

        let decisions: Vec<(usize, bool)> = self
            .topology
            .outgoing(name)
            .iter()
            .map(|index| {
                let fires = match &self.flow.transitions[*index].kind {
                    TransitionKind::OnSuccess => true,
                    TransitionKind::OnCondition { condition, .. } => condition(response, ctx),
                    TransitionKind::OnError { .. } => false,
                };
                (*index, fires)
            })
            .collect();
        for (index, fires) in decisions {
            if fires {
                self.fire(index)?;
            } else {
                self.kill(index, SkipReason::ConditionNotMet)?;
            }
        }
        Ok(())
    }

    fn on_failure(&mut self, name: &str, error: String) -> Result<()> {
        self.node_mut(name)?.fail(error.clone())?;

        let handler_edges: Vec<usize> = self
            .topology
            .outgoing(name)
            .iter()
            .copied()
            .filter(|index| self.flow.transitions[*index].kind.is_error())
            .collect();

        if handler_edges.is_empty() {
            if self.activate(name)? {
                return Ok(());
            }
            return self.settle_failure(name);
        }

        let has_retry_edge = handler_edges.iter().any(|index| {
            let handler = &self.flow.transitions[*index].to;
            self.topology.outgoing(handler).iter().any(|back| {
                let transition = &self.flow.transitions[*back];
                !transition.kind.is_error() && transition.to == name
            })
        });
        for index in handler_edges {
            let transition = &self.flow.transitions[index];
            let instruction = match &transition.kind {
                TransitionKind::OnError { instruction } => instruction.clone(),
                _ => None,
            };
            self.handler_inputs.insert(
                transition.to.clone(),
                HandlerInput {
                    instruction,
                    error: error.clone(),
                },
            );
            debug!(node = %name, handler = %transition.to, "routing failure to error handler");
            self.fire(index)?;
        }

        let can_retry = self.nodes.get(name).map(AgentNode::can_retry).unwrap_or(false);
        if !(has_retry_edge && can_retry) {
            self.settle_failure(name)?;
        }
        Ok(())
    }

    /// 失败不会再重试：前向边全部失效
    fn settle_failure(&mut self, name: &str) -> Result<()> {
        self.node_mut(name)?.settle_failure();
        let forward: Vec<usize> = self
            .topology
            .outgoing(name)
            .iter()
            .copied()
            .filter(|index| !self.flow.transitions[*index].kind.is_error())
            .collect();
        for index in forward {
            self.kill(index, SkipReason::UpstreamFailed)?;
        }
        Ok(())
    }

    /// 没有节点运行时调用；仍在等待处理器重试的失败在此定案
    fn settle_waiting_failures(&mut self) -> bool {
        let waiting: Vec<String> = self
            .flow
            .agents
            .names()
            .iter()
            .filter(|name| {
                self.nodes
                    .get(name.as_str())
                    .map(|node| node.state() == NodeState::Failed && !node.is_settled_failure())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for name in &waiting {
            if let Err(err) = self.settle_failure(name) {
                warn!(node = %name, error = %err, "failed to settle node");
            }
        }
        !waiting.is_empty()
    }

    fn fire(&mut self, index: usize) -> Result<()> {
        self.edges[index] = EdgeState::Fired;
        let transition = &self.flow.transitions[index];
        let (source, target) = (transition.from.clone(), transition.to.clone());
        self.inbox.entry(target.clone()).or_default().push(source);

        let pending = self.state(&target) == Some(NodeState::Pending);
        if pending && !self.topology.is_back_edge(index) {
            self.evaluate_readiness(&target)
        } else {
            self.activate(&target).map(|_| ())
        }
    }

    fn kill(&mut self, index: usize, reason: SkipReason) -> Result<()> {
        self.edges[index] = EdgeState::Dead(reason);
        let target = self.flow.transitions[index].to.clone();
        if self.state(&target) == Some(NodeState::Pending) && !self.topology.is_back_edge(index) {
            self.evaluate_readiness(&target)?;
        }
        Ok(())
    }

    fn evaluate_readiness(&mut self, name: &str) -> Result<()> {
        let states: Vec<EdgeState> = self
            .topology
            .readiness_edges(name)
            .map(|index| self.edges[index])
            .collect();
        if states.iter().any(|state| *state == EdgeState::Unsettled) {
            return Ok(());
        }
        if states.iter().any(|state| *state == EdgeState::Fired) {
            self.activate(name)?;
            return Ok(());
        }
        let reason = if states
            .iter()
            .any(|state| *state == EdgeState::Dead(SkipReason::UpstreamFailed))
        {
            SkipReason::UpstreamFailed
        } else {
            SkipReason::ConditionNotMet
        };
        self.skip(name, reason)
    }

    fn skip(&mut self, name: &str, reason: SkipReason) -> Result<()> {
        debug!(node = %name, ?reason, "skipping node");
        self.node_mut(name)?.transition(NodeState::Skipped(reason))?;
        let outgoing = self.topology.outgoing(name).to_vec();
        for index in outgoing {
            self.kill(index, reason)?;
        }
        Ok(())
    }

    fn is_complete(&self, policy: CompletionPolicy) -> bool {
        self.topology.terminals.iter().all(|name| {
            let Some(node) = self.nodes.get(name) else {
                return false;
            };
            match node.state() {
                NodeState::Completed => true,
                NodeState::Failed => node.is_settled_failure(),
                NodeState::Skipped(SkipReason::UpstreamFailed) => true,
                NodeState::Skipped(SkipReason::ConditionNotMet) => {
                    policy == CompletionPolicy::ReachableTerminals
                }
                _ => false,
            }
        })
    }

    fn unfinished(&self) -> (Vec<String>, Vec<String>) {
        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for name in self.flow.agents.names() {
            match self.state(name) {
                Some(NodeState::Skipped(_)) => skipped.push(name.clone()),
                Some(NodeState::Completed) => {}
                Some(NodeState::Failed) => {}
                _ => pending.push(name.clone()),
            }
        }
        (pending, skipped)
    }

    fn into_result(mut self, ctx: &FlowContext, memory: &ExecutionMemory) -> CrewResult {
        for name in self.flow.agents.names() {
            if self.nodes.get(name).map(AgentNode::executions) == Some(0) {
                self.collector.skip(name.clone());
            }
        }

        let terminal_outputs: Vec<(String, String)> = self
            .topology
            .terminals
            .iter()
            .filter(|name| self.state(name) == Some(NodeState::Completed))
            .filter_map(|name| ctx.agent_result(name).map(|output| (name.clone(), output)))
            .collect();
        let output = match terminal_outputs.as_slice() {
            [] => self.collector.last_output().unwrap_or_default().to_string(),
            [(_, only)] => only.clone(),
            many => many
                .iter()
                .map(|(name, output)| format!("[{name}]: {output}"))
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        let reached_end = if self.topology.terminals.is_empty() {
            self.collector.any_completed()
        } else {
            !terminal_outputs.is_empty()
        };
        let status = CrewStatus::from_outcome(self.collector.has_errors(), reached_end);

        let node_states: Map<String, Value> = self
            .flow
            .agents
            .names()
            .iter()
            .filter_map(|name| {
                self.state(name)
                    .map(|state| (name.clone(), Value::String(state.to_string())))
            })
            .collect();
        let mut metadata = Map::new();
        metadata.insert("flow".to_string(), Value::String(self.flow.name.clone()));
        metadata.insert("iterations".to_string(), Value::from(self.iterations));
        metadata.insert(
            "completion_policy".to_string(),
            serde_json::to_value(self.flow.policy).unwrap_or(Value::Null),
        );
        metadata.insert("node_states".to_string(), Value::Object(node_states));
        metadata.insert(
            "recovered_errors".to_string(),
            Value::Object(std::mem::take(&mut self.recovered)),
        );
        metadata.insert(
            "execution_memory".to_string(),
            serde_json::to_value(memory.get_snapshot()).unwrap_or_else(|_| json!({})),
        );
        metadata.insert(
            "shared_data".to_string(),
            Value::Object(ctx.snapshot().shared_data),
        );

        info!(flow = %self.flow.name, ?status, iterations = self.iterations, "flow finished");
        self.collector.finish(output, status, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;
    use crate::flow::conditions::condition_output_contains;

    fn agent(name: &'static str, output: &'static str) -> Arc<dyn Agent> {
        Arc::new(FnAgent::new(name, move |_| Ok(AgentResponse::text(output))))
    }

    #[tokio::test]
    async fn linear_flow_passes_upstream_output() {
        let mut flow = AgentsFlow::new("linear");
        flow.add_agent(agent("draft", "first draft")).unwrap();
        flow.add_agent(Arc::new(FnAgent::new("polish", |input: AgentInput| {
            let upstream = input.upstream.first().map(|u| u.output.clone()).unwrap_or_default();
            Ok(AgentResponse::text(format!("polished {upstream}")))
        })))
        .unwrap();
        flow.task_flow("draft", ["polish"]);

        let result = flow.run_flow("write").await.unwrap();
        assert_eq!(result.output, "polished first draft");
        assert_eq!(result.status, CrewStatus::Completed);
        assert_eq!(result.execution_order, vec!["draft", "polish"]);
    }

    #[tokio::test]
    async fn untaken_branch_stalls_unless_reachable_policy() {
        let build = |policy| {
            let mut flow = AgentsFlow::new("branch").with_completion_policy(policy);
            flow.add_agent(agent("router", "route left")).unwrap();
            flow.add_agent(agent("left", "L")).unwrap();
            flow.add_agent(agent("right", "R")).unwrap();
            flow.task_flow_if("router", "left", "left", condition_output_contains("left"));
            flow.task_flow_if("router", "right", "right", condition_output_contains("right"));
            flow
        };

        let stalled = build(CompletionPolicy::AllTerminals).run_flow("go").await;
        assert!(matches!(
            stalled,
            Err(CrewError::WorkflowStalled { ref skipped, .. }) if skipped == &vec!["right".to_string()]
        ));

        let result = build(CompletionPolicy::ReachableTerminals)
            .run_flow("go")
            .await
            .unwrap();
        assert_eq!(result.output, "L");
        assert_eq!(result.skipped, vec!["right"]);
        assert_eq!(result.status, CrewStatus::Completed);
    }
}
