// 固定 agent 集合的执行模式：并行、顺序、DAG

mod dag;
mod result;

pub(crate) use dag::find_cycle;
pub(crate) use result::ResultCollector;

pub use dag::DependencyGraph;
pub use result::{
    AgentExecutionInfo, AgentTask, CrewMode, CrewResult, CrewStatus, ExecutionStatus,
};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentInput, AgentRegistry};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::{Embedder, ExecutionGraph, ExecutionMemory};
use crate::runtime::{AgentInvoker, Invocation};
use crate::state::FlowContext;
use crate::tools::ToolRegistry;

pub type CompletionCallback =
    Arc<dyn Fn(&str, &AgentExecutionInfo, &FlowContext) -> anyhow::Result<()> + Send + Sync>;

/// 并行 / 顺序 / DAG 三种执行模式的 agent 组
pub struct AgentCrew {
    name: String,
    agents: AgentRegistry,
    graph: DependencyGraph,
    tools: ToolRegistry,
    /// 最近一次运行的记忆；除非设置 `keep_memory`，每次运行都从全新存储开始
    memory: Mutex<ExecutionMemory>,
    context: Option<FlowContext>,
    max_concurrency: usize,
    keep_memory: bool,
    vectorize: bool,
    on_complete: Option<CompletionCallback>,
}

impl AgentCrew {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, &EngineConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            name: name.into(),
            agents: AgentRegistry::new(),
            graph: DependencyGraph::new(),
            tools: ToolRegistry::new(),
            memory: Mutex::new(ExecutionMemory::default()),
            context: None,
            max_concurrency: config.max_concurrency.max(1),
            keep_memory: !config.reset_memory,
            vectorize: config.vectorize_results,
            on_complete: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        self.agents.register(agent)?;
        self.graph.add_node(name);
        Ok(())
    }

    /// 声明所有 target 都依赖 `source`
    pub fn task_flow<I, S>(&mut self, source: &str, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for target in targets {
            self.graph.add_edge(source, target);
        }
    }

    pub fn on_agent_complete<F>(&mut self, callback: F)
    where
        F: Fn(&str, &AgentExecutionInfo, &FlowContext) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
    }

    pub fn with_context(mut self, context: FlowContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        let memory = self.memory.get_mut();
        *memory = memory.clone().with_embedder(embedder);
        self.vectorize = true;
        self
    }

    pub fn with_vectorize(mut self, vectorize: bool) -> Self {
        self.vectorize = vectorize;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools.extend(&tools);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn keep_memory_between_runs(mut self, keep: bool) -> Self {
        self.keep_memory = keep;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// 最近一次运行的记忆句柄
    pub fn memory(&self) -> ExecutionMemory {
        self.memory.lock().clone()
    }

    /// 已声明依赖的拓扑顺序
    pub fn validate_workflow(&self) -> Result<Vec<String>> {
        self.graph.topological_order()
    }

    pub async fn run(&self, mode: CrewMode, query: &str) -> Result<CrewResult> {
        match mode {
            CrewMode::Parallel => {
                let tasks = self
                    .agents
                    .names()
                    .iter()
                    .map(|name| AgentTask::new(name.clone(), query))
                    .collect();
                self.run_parallel(tasks).await
            }
            CrewMode::Sequential { pass_full_context } => {
                self.run_sequential(query, pass_full_context).await
            }
            CrewMode::Flow => self.run_flow(query).await,
        }
    }

    pub async fn run_parallel(&self, tasks: Vec<AgentTask>) -> Result<CrewResult> {
        let query = tasks
            .first()
            .map(|task| task.query.clone())
            .unwrap_or_default();
        let (ctx, invoker) = self.prepare(&query);
        info!(crew = %self.name, tasks = tasks.len(), "running crew in parallel");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        for task in &tasks {
            let invoker = invoker.clone();
            let semaphore = Arc::clone(&semaphore);
            let task = task.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let invocation = invoker
                    .invoke(&task.agent, AgentInput::new(task.query.clone()))
                    .await;
                (task.agent, invocation)
            });
        }

        let mut collector = ResultCollector::start();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((agent, invocation)) => {
                    self.notify(&agent, &invocation.info, &ctx);
                    collector.push(invocation.info);
                }
                Err(err) => warn!(crew = %self.name, error = %err, "parallel task aborted"),
            }
        }

        let output = tasks
            .iter()
            .filter_map(|task| {
                collector
                    .last_output_of(&task.agent)
                    .map(|output| format!("[{}]: {}", task.agent, output))
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let status = CrewStatus::from_outcome(collector.has_errors(), collector.any_completed());
        Ok(collector.finish(output, status, self.metadata("parallel", &ctx, invoker.memory())))
    }

    pub async fn run_sequential(
        &self,
        initial_query: &str,
        pass_full_context: bool,
    ) -> Result<CrewResult> {
        let (ctx, invoker) = self.prepare(initial_query);
        info!(crew = %self.name, agents = self.agents.len(), pass_full_context, "running crew sequentially");

        let names = self.agents.names().to_vec();
        let mut collector = ResultCollector::start();
        let mut completed: Vec<(String, String)> = Vec::new();

        for (index, name) in names.iter().enumerate() {
            let input = match completed.last() {
                None => AgentInput::new(initial_query),
                Some(_) if pass_full_context => completed.iter().fold(
                    AgentInput::new(initial_query),
                    |input, (agent, output)| input.with_upstream(agent.clone(), output.clone()),
                ),
                Some((_, previous)) => AgentInput::new(previous.clone()),
            };

            let invocation = invoker.invoke(name, input).await;
            self.notify(name, &invocation.info, &ctx);
            let output = invocation.output().map(str::to_string);
            collector.push(invocation.info);

            match output {
                Some(output) => completed.push((name.clone(), output)),
                None => {
                    for rest in &names[index + 1..] {
                        collector.skip(rest.clone());
                    }
                    debug!(crew = %self.name, failed = %name, "sequential chain stopped");
                    break;
                }
            }
        }

        let output = completed
            .last()
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        let status = if collector.has_errors() {
            CrewStatus::Failed
        } else {
            CrewStatus::Completed
        };
        Ok(collector.finish(output, status, self.metadata("sequential", &ctx, invoker.memory())))
    }

    pub async fn run_flow(&self, initial_task: &str) -> Result<CrewResult> {
        let order = self.validate_workflow()?;
        let (ctx, invoker) = self.prepare(initial_task);
        info!(crew = %self.name, agents = order.len(), "running crew flow");

        let mut remaining: HashMap<&str, usize> = order
            .iter()
            .map(|name| (name.as_str(), self.graph.dependencies(name).len()))
            .collect();
        let mut status: HashMap<String, ExecutionStatus> = order
            .iter()
            .map(|name| (name.clone(), ExecutionStatus::Pending))
            .collect();
        let mut outputs: HashMap<String, String> = HashMap::new();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(String, Invocation)> = JoinSet::new();
        let mut collector = ResultCollector::start();

        for name in order.iter().filter(|name| remaining.get(name.as_str()) == Some(&0)) {
            status.insert(name.clone(), ExecutionStatus::Running);
            self.spawn_node(&mut join_set, &invoker, &semaphore, name, AgentInput::new(initial_task));
        }

        while let Some(joined) = join_set.join_next().await {
            let (name, invocation) = match joined {
                Ok(finished) => finished,
                Err(err) => {
                    warn!(crew = %self.name, error = %err, "flow task aborted");
                    continue;
                }
            };
            self.notify(&name, &invocation.info, &ctx);
            let output = invocation.output().map(str::to_string);
            collector.push(invocation.info);

            match output {
                Some(output) => {
                    status.insert(name.clone(), ExecutionStatus::Completed);
                    outputs.insert(name.clone(), output);
                    for next in self.graph.dependents(&name) {
                        let Some(count) = remaining.get_mut(next) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count > 0 || status.get(next) != Some(&ExecutionStatus::Pending) {
                            continue;
                        }
                        let input = self.graph.dependencies(next).into_iter().fold(
                            AgentInput::new(initial_task),
                            |input, dep| match outputs.get(dep) {
                                Some(output) => input.with_upstream(dep, output.clone()),
                                None => input,
                            },
                        );
                        status.insert(next.to_string(), ExecutionStatus::Running);
                        self.spawn_node(&mut join_set, &invoker, &semaphore, next, input);
                    }
                }
                None => {
                    status.insert(name.clone(), ExecutionStatus::Failed);
                    self.skip_downstream(&name, &mut status, &mut collector);
                }
            }
        }

        for name in &order {
            if status.get(name) == Some(&ExecutionStatus::Pending) {
                collector.skip(name.clone());
            }
        }

        let terminals = self.graph.terminals();
        let terminal_outputs: Vec<&str> = terminals
            .iter()
            .filter_map(|name| outputs.get(*name).map(String::as_str))
            .collect();
        let output = if terminal_outputs.len() == 1 {
            terminal_outputs[0].to_string()
        } else {
            terminals
                .iter()
                .filter_map(|name| outputs.get(*name).map(|out| format!("[{name}]: {out}")))
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let status = CrewStatus::from_outcome(collector.has_errors(), !terminal_outputs.is_empty());
        Ok(collector.finish(output, status, self.metadata("flow", &ctx, invoker.memory())))
    }

    fn spawn_node(
        &self,
        join_set: &mut JoinSet<(String, Invocation)>,
        invoker: &AgentInvoker,
        semaphore: &Arc<Semaphore>,
        name: &str,
        input: AgentInput,
    ) {
        debug!(crew = %self.name, agent = %name, "agent ready");
        let invoker = invoker.clone();
        let semaphore = Arc::clone(semaphore);
        let name = name.to_string();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let invocation = invoker.invoke(&name, input).await;
            (name, invocation)
        });
    }

    fn skip_downstream(
        &self,
        failed: &str,
        status: &mut HashMap<String, ExecutionStatus>,
        collector: &mut ResultCollector,
    ) {
        let mut stack: Vec<String> = self
            .graph
            .dependents(failed)
            .into_iter()
            .map(str::to_string)
            .collect();
        while let Some(name) = stack.pop() {
            if status.get(&name) != Some(&ExecutionStatus::Pending) {
                continue;
            }
            debug!(crew = %self.name, agent = %name, upstream = %failed, "skipping agent after upstream failure");
            status.insert(name.clone(), ExecutionStatus::Skipped);
            stack.extend(self.graph.dependents(&name).into_iter().map(str::to_string));
            collector.skip(name);
        }
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
        for (source, target) in self.graph.edges() {
            graph = graph.with_edge(source.clone(), target.clone(), "dependency");
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

    fn notify(&self, agent: &str, info: &AgentExecutionInfo, ctx: &FlowContext) {
        let Some(callback) = &self.on_complete else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| callback(agent, info, ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(crew = %self.name, agent, error = %err, "completion callback failed"),
            Err(_) => warn!(crew = %self.name, agent, "completion callback panicked"),
        }
    }

    fn metadata(&self, mode: &str, ctx: &FlowContext, memory: &ExecutionMemory) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("crew".to_string(), Value::String(self.name.clone()));
        metadata.insert("mode".to_string(), Value::String(mode.to_string()));
        metadata.insert(
            "execution_memory".to_string(),
            serde_json::to_value(memory.get_snapshot()).unwrap_or_else(|_| json!({})),
        );
        metadata.insert(
            "shared_data".to_string(),
            Value::Object(ctx.snapshot().shared_data),
        );
        metadata
    }
}
