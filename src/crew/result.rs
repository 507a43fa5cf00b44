use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{AgentResponse, ToolCallRecord};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }
}

/// 单个 agent 的执行记录
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentExecutionInfo {
    pub agent_name: String,
    pub agent_id: String,
    pub status: ExecutionStatus,
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentExecutionInfo {
    pub fn new(agent_id: impl Into<String>, input_query: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            agent_name: agent_id.clone(),
            agent_id,
            status: ExecutionStatus::Pending,
            execution_time: 0.0,
            model: None,
            input_query: input_query.into(),
            output: None,
            error: None,
            tool_calls: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// 记录已是最终状态时返回 `false`
    pub fn mark_running(&mut self) -> bool {
        if self.status.is_final() {
            return false;
        }
        self.status = ExecutionStatus::Running;
        true
    }

    pub fn finish_success(&mut self, response: &AgentResponse, elapsed: f64) -> bool {
        if self.status.is_final() {
            return false;
        }
        self.status = ExecutionStatus::Completed;
        self.execution_time = elapsed;
        self.output = Some(response.output.clone());
        self.tool_calls = response.tool_calls.clone();
        if response.model.is_some() {
            self.model = response.model.clone();
        }
        for (key, value) in &response.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        true
    }

    pub fn finish_failure(&mut self, error: impl Into<String>, elapsed: f64) -> bool {
        if self.status.is_final() {
            return false;
        }
        self.status = ExecutionStatus::Failed;
        self.execution_time = elapsed;
        self.error = Some(error.into());
        true
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_final() {
            return false;
        }
        self.status = ExecutionStatus::Skipped;
        self.metadata
            .insert("skip_reason".to_string(), Value::String(reason.into()));
        true
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrewStatus {
    Completed,
    Failed,
    Partial,
}

impl CrewStatus {
    pub fn from_outcome(has_errors: bool, any_completed: bool) -> Self {
        match (has_errors, any_completed) {
            (false, _) => CrewStatus::Completed,
            (true, true) => CrewStatus::Partial,
            (true, false) => CrewStatus::Failed,
        }
    }
}

/// 一次运行的汇总结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrewResult {
    pub output: String,
    pub status: CrewStatus,
    pub success: bool,
    pub agents: Vec<AgentExecutionInfo>,
    pub total_time: f64,
    pub execution_order: Vec<String>,
    pub agent_results: BTreeMap<String, String>,
    pub errors: BTreeMap<String, String>,
    /// 从未运行的 agent
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CrewResult {
    pub fn content(&self) -> &str {
        &self.output
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentExecutionInfo> {
        self.agents.iter().rev().find(|info| info.agent_id == agent_id)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 按完成顺序收集执行记录并组装 `CrewResult`
pub(crate) struct ResultCollector {
    started: Instant,
    agents: Vec<AgentExecutionInfo>,
    agent_results: BTreeMap<String, String>,
    errors: BTreeMap<String, String>,
    skipped: Vec<String>,
}

impl ResultCollector {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            agents: Vec::new(),
            agent_results: BTreeMap::new(),
            errors: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    pub fn push(&mut self, info: AgentExecutionInfo) {
        match info.status {
            ExecutionStatus::Completed => {
                if let Some(output) = &info.output {
                    self.agent_results
                        .insert(info.agent_id.clone(), output.clone());
                }
            }
            ExecutionStatus::Failed => {
                let message = info.error.clone().unwrap_or_default();
                self.errors.insert(info.agent_id.clone(), message);
            }
            _ => {}
        }
        self.agents.push(info);
    }

    pub fn skip(&mut self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        if !self.skipped.contains(&agent_id) {
            self.skipped.push(agent_id);
        }
    }

    /// 之后的成功会清除先前的失败，并返回旧的错误信息
    pub fn recover(&mut self, agent_id: &str) -> Option<String> {
        self.errors.remove(agent_id)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn any_completed(&self) -> bool {
        self.agents.iter().any(AgentExecutionInfo::is_success)
    }

    pub fn last_output(&self) -> Option<&str> {
        self.agents
            .iter()
            .rev()
            .find(|info| info.is_success())
            .and_then(|info| info.output.as_deref())
    }

    pub fn last_output_of(&self, agent_id: &str) -> Option<&str> {
        self.agent_results.get(agent_id).map(String::as_str)
    }

    pub fn finish(
        self,
        output: String,
        status: CrewStatus,
        metadata: Map<String, Value>,
    ) -> CrewResult {
        let execution_order = self
            .agents
            .iter()
            .map(|info| info.agent_id.clone())
            .collect();
        CrewResult {
            output,
            success: self.errors.is_empty(),
            status,
            total_time: self.started.elapsed().as_secs_f64(),
            execution_order,
            agents: self.agents,
            agent_results: self.agent_results,
            errors: self.errors,
            skipped: self.skipped,
            metadata,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub agent: String,
    pub query: String,
}

impl AgentTask {
    pub fn new(agent: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            query: query.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CrewMode {
    /// 所有已注册的 agent 收到相同的查询
    Parallel,
    Sequential { pass_full_context: bool },
    Flow,
}
