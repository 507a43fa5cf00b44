use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrewError>;

#[derive(Debug, Error)]
pub enum CrewError {
    #[error("agent `{0}` not registered")]
    AgentNotRegistered(String),
    #[error("agent `{0}` is already registered")]
    DuplicateAgent(String),
    #[error("agent `{agent}` failed: {message}")]
    AgentInvocation { agent: String, message: String },
    #[error("tool `{0}` not registered")]
    ToolNotRegistered(String),
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
    #[error("unknown node `{0}` in flow")]
    UnknownNode(String),
    #[error("invalid transition from `{from}` to `{to}`")]
    InvalidTransition { from: String, to: String },
    #[error("quorum not met: {received} usable votes, {required} required")]
    QuorumNotMet { required: usize, received: usize },
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("workflow stalled: no ready agents and no active agents (pending: {pending:?}, skipped: {skipped:?})")]
    WorkflowStalled {
        pending: Vec<String>,
        skipped: Vec<String>,
    },
    #[error("agent `{agent}` returned output that does not match the decision schema: {reason}")]
    InvalidDecisionSchema { agent: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("maximum iterations {0} exceeded")]
    MaxIterationsExceeded(u32),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("context error: {0}")]
    Context(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrewError {
    pub fn invocation(agent: impl Into<String>, message: impl ToString) -> Self {
        CrewError::AgentInvocation {
            agent: agent.into(),
            message: message.to_string(),
        }
    }

    /// 结构性错误：工作流无法给出有意义的部分结果
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CrewError::CycleDetected(_)
                | CrewError::QuorumNotMet { .. }
                | CrewError::WorkflowStalled { .. }
                | CrewError::MaxIterationsExceeded(_)
                | CrewError::InvalidConfiguration(_)
        )
    }
}

impl From<serde_json::Error> for CrewError {
    fn from(err: serde_json::Error) -> Self {
        CrewError::Serialization(err.to_string())
    }
}
