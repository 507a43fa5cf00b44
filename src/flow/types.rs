use std::fmt;

use serde::{Deserialize, Serialize};

use super::conditions::TransitionCondition;

/// Flow 转换类型
#[derive(Clone)]
pub enum TransitionKind {
    OnSuccess,
    OnCondition {
        name: String,
        condition: TransitionCondition,
    },
    /// source 失败时触发；target 作为其错误处理器
    OnError { instruction: Option<String> },
}

impl TransitionKind {
    pub fn is_error(&self) -> bool {
        matches!(self, TransitionKind::OnError { .. })
    }

    pub fn label(&self) -> &str {
        match self {
            TransitionKind::OnSuccess => "success",
            TransitionKind::OnCondition { name, .. } => name,
            TransitionKind::OnError { .. } => "error",
        }
    }
}

impl fmt::Debug for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::OnSuccess => f.write_str("OnSuccess"),
            TransitionKind::OnCondition { name, .. } => {
                f.debug_struct("OnCondition").field("name", name).finish()
            }
            TransitionKind::OnError { instruction } => f
                .debug_struct("OnError")
                .field("instruction", instruction)
                .finish(),
        }
    }
}

/// Flow 转换
#[derive(Clone, Debug)]
pub struct FlowTransition {
    pub from: String,
    pub to: String,
    pub kind: TransitionKind,
}

/// 工作流完成判定
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// 所有终止节点均已完成、最终失败或因上游失败而跳过
    #[default]
    AllTerminals,
    /// 忽略条件未满足分支上的终止节点
    ReachableTerminals,
}

impl std::str::FromStr for CompletionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all_terminals" | "all" => Ok(CompletionPolicy::AllTerminals),
            "reachable_terminals" | "reachable" => Ok(CompletionPolicy::ReachableTerminals),
            other => Err(format!("unknown completion policy `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionNotMet,
    UpstreamFailed,
}

/// 节点重试选项
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeOptions {
    #[serde(default = "default_can_retry")]
    pub can_retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

pub(crate) fn default_can_retry() -> bool {
    true
}

pub(crate) fn default_max_retries() -> u32 {
    3
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            can_retry: default_can_retry(),
            max_retries: default_max_retries(),
        }
    }
}

impl NodeOptions {
    pub fn no_retry() -> Self {
        Self {
            can_retry: false,
            max_retries: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
