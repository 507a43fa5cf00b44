// 状态机工作流：节点状态、转换条件、调度

pub mod conditions;
mod engine;
mod fsm;
mod topology;
pub mod types;

pub use conditions::{
    condition_always, condition_decision_equals, condition_from_fn, condition_metadata_equals,
    condition_output_contains, condition_state_absent, condition_state_equals,
    condition_state_exists, TransitionCondition,
};
pub use engine::AgentsFlow;
pub use fsm::{AgentNode, NodeState};
pub use topology::FlowPlan;
pub use types::{CompletionPolicy, FlowTransition, NodeOptions, SkipReason, TransitionKind};
