mod ballot;
mod escalation;
mod node;
mod schema;
mod types;

pub use ballot::{consensus_level, tally, vote_weight, Tally, NEUTRAL_CONFIDENCE};
pub use escalation::{
    DynHumanChannel, EscalationOutcome, EscalationPolicy, EscalationReason, EscalationRequest,
    EscalationResolution, HumanChannel, HumanResponse,
};
pub use node::DecisionFlowNode;
pub use schema::{DecisionSchema, ParsedDecision};
pub use types::{ConsensusLevel, DecisionMode, DecisionResult, Vote, VoteWeighting};
