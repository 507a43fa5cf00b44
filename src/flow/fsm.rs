use std::fmt;

use serde::Serialize;

use crate::error::{CrewError, Result};

use super::types::{NodeOptions, SkipReason};

/// 节点状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped(SkipReason),
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Pending => f.write_str("pending"),
            NodeState::Ready => f.write_str("ready"),
            NodeState::Running => f.write_str("running"),
            NodeState::Completed => f.write_str("completed"),
            NodeState::Failed => f.write_str("failed"),
            NodeState::Skipped(SkipReason::ConditionNotMet) => f.write_str("skipped(condition_not_met)"),
            NodeState::Skipped(SkipReason::UpstreamFailed) => f.write_str("skipped(upstream_failed)"),
        }
    }
}

fn allowed(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Skipped(_))
            | (Ready, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Ready)
            | (Completed, Ready)
            | (Skipped(_), Ready)
    )
}

/// 单个 agent 节点的状态机
#[derive(Clone, Debug)]
pub struct AgentNode {
    pub name: String,
    pub options: NodeOptions,
    state: NodeState,
    retries: u32,
    executions: u32,
    last_error: Option<String>,
    /// 不会再重试的失败；出边全部失效
    settled_failure: bool,
}

impl AgentNode {
    pub fn new(name: impl Into<String>, options: NodeOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: NodeState::Pending,
            retries: 0,
            executions: 0,
            last_error: None,
            settled_failure: false,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn executions(&self) -> u32 {
        self.executions
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_settled_failure(&self) -> bool {
        self.state == NodeState::Failed && self.settled_failure
    }

    pub fn can_retry(&self) -> bool {
        self.options.can_retry && self.retries < self.options.max_retries
    }

    pub fn transition(&mut self, to: NodeState) -> Result<()> {
        if !allowed(self.state, to) {
            return Err(CrewError::InvalidTransition {
                from: format!("{}:{}", self.name, self.state),
                to: to.to_string(),
            });
        }
        if self.state == NodeState::Failed && to == NodeState::Ready {
            if !self.can_retry() {
                return Err(CrewError::InvalidTransition {
                    from: format!("{}:{}", self.name, self.state),
                    to: format!("{to} (retry budget exhausted)"),
                });
            }
            self.retries += 1;
        }
        match to {
            NodeState::Running => self.executions += 1,
            NodeState::Completed => {
                self.last_error = None;
                self.settled_failure = false;
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(NodeState::Failed)?;
        self.last_error = Some(error.into());
        self.settled_failure = false;
        Ok(())
    }

    pub fn settle_failure(&mut self) {
        if self.state == NodeState::Failed {
            self.settled_failure = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_illegal_jumps() {
        let mut node = AgentNode::new("writer", NodeOptions::default());
        assert!(matches!(
            node.transition(NodeState::Running),
            Err(CrewError::InvalidTransition { .. })
        ));
        node.transition(NodeState::Ready).unwrap();
        node.transition(NodeState::Running).unwrap();
        node.transition(NodeState::Completed).unwrap();
        assert_eq!(node.executions(), 1);
        assert!(node.transition(NodeState::Failed).is_err());
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut node = AgentNode::new("flaky", NodeOptions::default().with_max_retries(1));
        node.transition(NodeState::Ready).unwrap();
        node.transition(NodeState::Running).unwrap();
        node.fail("timeout").unwrap();
        assert!(node.can_retry());
        node.transition(NodeState::Ready).unwrap();
        node.transition(NodeState::Running).unwrap();
        node.fail("timeout again").unwrap();
        assert_eq!(node.retries(), 1);
        assert!(!node.can_retry());
        assert!(node.transition(NodeState::Ready).is_err());
        assert_eq!(node.last_error(), Some("timeout again"));
    }

    #[test]
    fn non_retryable_node_stays_failed() {
        let mut node = AgentNode::new("once", NodeOptions::no_retry());
        node.transition(NodeState::Ready).unwrap();
        node.transition(NodeState::Running).unwrap();
        node.fail("boom").unwrap();
        assert!(!node.can_retry());
        node.settle_failure();
        assert!(node.is_settled_failure());
    }
}
