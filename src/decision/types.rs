use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::escalation::EscalationOutcome;

/// 决策协议
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    /// 由单个协调者决策
    Cio,
    Ballot,
    Consensus,
}

impl fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionMode::Cio => f.write_str("cio"),
            DecisionMode::Ballot => f.write_str("ballot"),
            DecisionMode::Consensus => f.write_str("consensus"),
        }
    }
}

impl std::str::FromStr for DecisionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cio" => Ok(DecisionMode::Cio),
            "ballot" | "vote" => Ok(DecisionMode::Ballot),
            "consensus" => Ok(DecisionMode::Consensus),
            other => Err(format!("unknown decision mode `{other}`")),
        }
    }
}

/// 投票权重策略
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "weights")]
pub enum VoteWeighting {
    #[default]
    Equal,
    /// 按 agent 指定权重；未列出的 agent 权重为 1.0
    Custom(HashMap<String, f64>),
    /// 第一个注册的参与者为 1.0，之后依次为 1/2、1/3 ……
    Seniority,
    /// 每张投票以其报告的置信度为权重
    Confidence,
}

/// 共识等级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusLevel {
    Unanimous,
    StrongMajority,
    Majority,
    Divided,
    Deadlock,
}

impl ConsensusLevel {
    pub fn is_split(&self) -> bool {
        matches!(self, ConsensusLevel::Divided | ConsensusLevel::Deadlock)
    }
}

impl fmt::Display for ConsensusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConsensusLevel::Unanimous => "UNANIMOUS",
            ConsensusLevel::StrongMajority => "STRONG_MAJORITY",
            ConsensusLevel::Majority => "MAJORITY",
            ConsensusLevel::Divided => "DIVIDED",
            ConsensusLevel::Deadlock => "DEADLOCK",
        };
        f.write_str(label)
    }
}

/// 单个 agent 的投票
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub weight: f64,
}

impl Vote {
    pub fn new(agent: impl Into<String>, decision: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            decision: decision.into(),
            confidence: None,
            reasoning: None,
            weight: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// 一次 `ask()` 的结果，创建后不再修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub final_decision: String,
    pub consensus_level: ConsensusLevel,
    pub votes: Vec<Vote>,
    pub confidence: f64,
    pub escalated: bool,
    pub mode: DecisionMode,
    /// 调用失败或输出不符合 schema 的 agent
    #[serde(default)]
    pub failed_agents: BTreeMap<String, String>,
    /// 每个决策值占总投票权重的比例
    #[serde(default)]
    pub distribution: BTreeMap<String, f64>,
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationOutcome>,
}

impl DecisionResult {
    pub fn vote_of(&self, agent: &str) -> Option<&Vote> {
        self.votes.iter().find(|vote| vote.agent == agent)
    }
}
