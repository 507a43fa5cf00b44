use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::agent::{Agent, AgentFactoryRegistry};
use crate::decision::{DecisionFlowNode, DecisionMode, DecisionSchema, EscalationPolicy, VoteWeighting};
use crate::error::{CrewError, Result};
use crate::flow::types::NodeOptions;
use crate::flow::{
    condition_always, condition_decision_equals, condition_metadata_equals,
    condition_output_contains, condition_state_absent, condition_state_equals,
    condition_state_exists, AgentsFlow, TransitionCondition,
};
use crate::utils::validation::ConfigValidator;

use super::engine::EngineConfig;

/// 工作流配置文件
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub decisions: Vec<DecisionSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

/// agent 定义：`kind` 选择工厂，其余字段交给工厂
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl AgentSpec {
    fn build(&self, factories: &AgentFactoryRegistry) -> Result<Arc<dyn Agent>> {
        let mut params = self.params.clone();
        params.insert("name".to_string(), Value::String(self.name.clone()));
        factories.build(&self.kind, Some(Value::Object(params)))
    }

    fn options(&self, engine: &EngineConfig) -> NodeOptions {
        NodeOptions {
            can_retry: self.can_retry.unwrap_or(true),
            max_retries: self.max_retries.unwrap_or(engine.max_retries),
        }
    }
}

/// 决策节点定义
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionSpec {
    pub name: String,
    pub mode: DecisionMode,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<AgentSpec>,
    #[serde(default)]
    pub weighting: VoteWeighting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_votes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_pollination_rounds: Option<u32>,
    #[serde(default)]
    pub schema: DecisionSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_retry: Option<bool>,
}

impl DecisionSpec {
    pub fn build(&self, factories: &AgentFactoryRegistry) -> Result<DecisionFlowNode> {
        let mut node = DecisionFlowNode::new(self.name.clone(), self.mode)
            .with_weighting(self.weighting.clone())
            .with_schema(self.schema.clone());
        if let Some(coordinator) = &self.coordinator {
            node.set_coordinator(coordinator.build(factories)?)?;
        }
        for member in &self.agents {
            node.add_agent(member.build(factories)?)?;
        }
        if let Some(minimum) = self.minimum_votes {
            node = node.with_minimum_votes(minimum);
        }
        if let Some(rounds) = self.cross_pollination_rounds {
            node = node.with_cross_pollination_rounds(rounds);
        }
        if let Some(policy) = &self.escalation {
            node = node.with_escalation(policy.clone());
        }
        node.validate()?;
        Ok(node)
    }
}

/// 边定义
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeConfig {
    Success {
        from: String,
        to: String,
    },
    Condition {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        condition: ConditionConfig,
    },
    Error {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
}

/// 结构化的条件定义
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    Always,
    OutputContains { value: String },
    StateEquals { key: String, value: Value },
    StateExists { key: String },
    StateAbsent { key: String },
    DecisionEquals { value: String },
    MetadataEquals { key: String, value: Value },
}

impl ConditionConfig {
    pub fn label(&self) -> String {
        match self {
            ConditionConfig::Always => "always".to_string(),
            ConditionConfig::OutputContains { value } => format!("output_contains:{value}"),
            ConditionConfig::StateEquals { key, value } => format!("state_equals:{key}={value}"),
            ConditionConfig::StateExists { key } => format!("state_exists:{key}"),
            ConditionConfig::StateAbsent { key } => format!("state_absent:{key}"),
            ConditionConfig::DecisionEquals { value } => format!("decision_equals:{value}"),
            ConditionConfig::MetadataEquals { key, value } => {
                format!("metadata_equals:{key}={value}")
            }
        }
    }

    pub fn to_condition(&self) -> TransitionCondition {
        match self.clone() {
            ConditionConfig::Always => condition_always(),
            ConditionConfig::OutputContains { value } => condition_output_contains(value),
            ConditionConfig::StateEquals { key, value } => condition_state_equals(key, value),
            ConditionConfig::StateExists { key } => condition_state_exists(key),
            ConditionConfig::StateAbsent { key } => condition_state_absent(key),
            ConditionConfig::DecisionEquals { value } => condition_decision_equals(value),
            ConditionConfig::MetadataEquals { key, value } => condition_metadata_equals(key, value),
        }
    }
}

impl WorkflowConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| CrewError::InvalidConfiguration(format!("workflow config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            CrewError::InvalidConfiguration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// 只校验名称与限制；图结构由 `AgentsFlow::validate_workflow` 检查
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_workflow_name(&self.name)?;
        self.engine.validate()?;
        let mut seen = HashSet::new();
        let names = self
            .agents
            .iter()
            .map(|agent| agent.name.as_str())
            .chain(self.decisions.iter().map(|decision| decision.name.as_str()));
        for name in names {
            ConfigValidator::validate_agent_name(name)?;
            if !seen.insert(name) {
                return Err(CrewError::DuplicateAgent(name.to_string()));
            }
        }
        Ok(())
    }

    pub fn build_flow(&self, factories: &AgentFactoryRegistry) -> Result<AgentsFlow> {
        self.validate()?;
        let mut flow = AgentsFlow::with_config(self.name.clone(), &self.engine);
        for spec in &self.agents {
            flow.add_agent_with(spec.build(factories)?, spec.options(&self.engine))?;
        }
        for spec in &self.decisions {
            let options = NodeOptions {
                can_retry: spec.can_retry.unwrap_or(false),
                max_retries: self.engine.max_retries,
            };
            flow.add_agent_with(Arc::new(spec.build(factories)?), options)?;
        }
        for edge in &self.edges {
            match edge {
                EdgeConfig::Success { from, to } => flow.task_flow(from, [to.clone()]),
                EdgeConfig::Condition {
                    from,
                    to,
                    name,
                    condition,
                } => flow.task_flow_if(
                    from,
                    to,
                    name.clone().unwrap_or_else(|| condition.label()),
                    condition.to_condition(),
                ),
                EdgeConfig::Error {
                    from,
                    to,
                    instruction,
                } => flow.on_error(from, to, instruction.as_deref()),
            }
        }
        if let Some(entry) = &self.entry {
            flow.set_entry(entry.clone());
        }
        debug!(workflow = %self.name, agents = self.agents.len(), decisions = self.decisions.len(), edges = self.edges.len(), "workflow built");
        Ok(flow)
    }
}
