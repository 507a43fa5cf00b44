use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::{Agent, AgentContext, AgentInput, AgentRegistry, AgentResponse};
use crate::error::{CrewError, Result};
use crate::memory::ExecutionMemory;
use crate::runtime::AgentInvoker;
use crate::state::FlowContext;
use crate::tools::ToolRegistry;
use crate::utils::validation::ConfigValidator;

use super::ballot::{consensus_level, tally, vote_weight};
use super::escalation::{DynHumanChannel, EscalationPolicy, EscalationRequest, EscalationResolution};
use super::schema::{DecisionSchema, ParsedDecision};
use super::types::{ConsensusLevel, DecisionMode, DecisionResult, Vote, VoteWeighting};

const DEFAULT_MINIMUM_VOTES: usize = 2;
const DEFAULT_ROUNDS: u32 = 1;

const REVISE_INSTRUCTION: &str =
    "Other participants answered below. Reconsider your position in light of their arguments.";
const SYNTHESIZE_INSTRUCTION: &str =
    "You coordinate this decision. Weigh the participants' final positions below and state the group's decision.";

/// 多 agent 决策节点
///
/// 可通过 [`DecisionFlowNode::ask`] 单独使用，也可作为
/// agent 注册到 `AgentsFlow` 中。作为 agent 时输出为最终
/// 决策，`structured` 携带完整的 [`DecisionResult`]
pub struct DecisionFlowNode {
    name: String,
    description: Option<String>,
    mode: DecisionMode,
    agents: AgentRegistry,
    coordinator: Option<String>,
    weighting: VoteWeighting,
    minimum_votes: usize,
    rounds: u32,
    schema: DecisionSchema,
    escalation: Option<EscalationPolicy>,
    channel: Option<DynHumanChannel>,
    tools: ToolRegistry,
}

/// 升级前的决策
struct Proposal {
    decision: String,
    confidence: f64,
    level: ConsensusLevel,
    votes: Vec<Vote>,
    distribution: BTreeMap<String, f64>,
    failed_agents: BTreeMap<String, String>,
    rounds: u32,
}

impl DecisionFlowNode {
    pub fn new(name: impl Into<String>, mode: DecisionMode) -> Self {
        Self {
            name: name.into(),
            description: None,
            mode,
            agents: AgentRegistry::new(),
            coordinator: None,
            weighting: VoteWeighting::default(),
            minimum_votes: DEFAULT_MINIMUM_VOTES,
            rounds: DEFAULT_ROUNDS,
            schema: DecisionSchema::default(),
            escalation: None,
            channel: None,
            tools: ToolRegistry::new(),
        }
    }

    pub fn cio(name: impl Into<String>, agent: Arc<dyn Agent>) -> Result<Self> {
        let mut node = Self::new(name, DecisionMode::Cio);
        node.add_agent(agent)?;
        Ok(node)
    }

    pub fn ballot<I>(name: impl Into<String>, agents: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Agent>>,
    {
        let mut node = Self::new(name, DecisionMode::Ballot);
        for agent in agents {
            node.add_agent(agent)?;
        }
        Ok(node)
    }

    pub fn consensus<I>(name: impl Into<String>, coordinator: Arc<dyn Agent>, participants: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Agent>>,
    {
        let mut node = Self::new(name, DecisionMode::Consensus);
        node.set_coordinator(coordinator)?;
        for agent in participants {
            node.add_agent(agent)?;
        }
        Ok(node)
    }

    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        self.agents.register(agent)
    }

    pub fn set_coordinator(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        self.agents.register(agent)?;
        self.coordinator = Some(name);
        Ok(())
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: DecisionSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_weighting(mut self, weighting: VoteWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_minimum_votes(mut self, minimum_votes: usize) -> Self {
        self.minimum_votes = minimum_votes;
        self
    }

    pub fn with_cross_pollination_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_escalation(mut self, policy: EscalationPolicy) -> Self {
        self.escalation = Some(policy);
        self
    }

    pub fn with_human_channel(mut self, channel: DynHumanChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn mode(&self) -> DecisionMode {
        self.mode
    }

    pub fn coordinator(&self) -> Option<&str> {
        self.coordinator.as_deref()
    }

    /// 按注册顺序排列的投票 agent（不含协调者）
    pub fn participants(&self) -> Vec<String> {
        self.agents
            .names()
            .iter()
            .filter(|name| Some(name.as_str()) != self.coordinator.as_deref())
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_agent_name(&self.name)?;
        let invalid = |message: String| Err(CrewError::InvalidConfiguration(message));
        match self.mode {
            DecisionMode::Cio if self.agents.len() != 1 => {
                return invalid(format!(
                    "cio decision `{}` needs exactly one agent, found {}",
                    self.name,
                    self.agents.len()
                ))
            }
            DecisionMode::Ballot => {
                let voters = self.agents.len();
                if voters < 2 {
                    return invalid(format!("ballot decision `{}` needs at least two agents", self.name));
                }
                if self.minimum_votes == 0 || self.minimum_votes > voters {
                    return invalid(format!(
                        "minimum_votes {} must be between 1 and {voters}",
                        self.minimum_votes
                    ));
                }
            }
            DecisionMode::Consensus => {
                if self.coordinator.is_none() {
                    return invalid(format!("consensus decision `{}` has no coordinator", self.name));
                }
                if self.agents.len() < 3 {
                    return invalid(format!(
                        "consensus decision `{}` needs at least three agents including the coordinator",
                        self.name
                    ));
                }
            }
            DecisionMode::Cio => {}
        }
        if let VoteWeighting::Custom(weights) = &self.weighting {
            ConfigValidator::validate_weights(weights)?;
        }
        if let Some(threshold) = self.escalation.as_ref().and_then(|policy| policy.on_low_confidence) {
            ConfigValidator::validate_threshold("on_low_confidence", threshold)?;
        }
        Ok(())
    }

    /// 以全新的上下文与记忆执行一次决策
    pub async fn ask(&self, question: &str) -> Result<DecisionResult> {
        self.decide(
            AgentInput::new(question),
            FlowContext::new(question),
            ExecutionMemory::new(question),
        )
        .await
    }

    async fn decide(
        &self,
        base: AgentInput,
        ctx: FlowContext,
        memory: ExecutionMemory,
    ) -> Result<DecisionResult> {
        self.validate()?;
        let invoker = AgentInvoker::new(Arc::new(self.agents.clone()), &self.tools, memory, ctx);
        let span = info_span!("decision", node = %self.name, mode = %self.mode);

        async {
            let proposal = match self.mode {
                DecisionMode::Cio => self.run_cio(&invoker, &base).await?,
                DecisionMode::Ballot => self.run_ballot(&invoker, &base).await?,
                DecisionMode::Consensus => self.run_consensus(&invoker, &base).await?,
            };
            let result = self.finish(&base.query, proposal).await;
            info!(
                decision = %result.final_decision,
                level = %result.consensus_level,
                confidence = result.confidence,
                escalated = result.escalated,
                "decision reached"
            );
            Ok::<_, CrewError>(result)
        }
        .instrument(span)
        .await
    }

    fn vote_input(&self, base: &AgentInput) -> AgentInput {
        let instruction = match &base.instruction {
            Some(existing) => format!("{existing}\n\n{}", self.schema.instruction()),
            None => self.schema.instruction(),
        };
        let mut input = base.clone().with_schema(self.schema.to_json_schema());
        input.instruction = Some(instruction);
        input
    }

    fn weigh(&self, parsed: ParsedDecision, agent: &str) -> Vote {
        let seniority = self
            .participants()
            .iter()
            .position(|name| name == agent)
            .unwrap_or(0);
        let mut vote = Vote::new(agent, parsed.decision);
        vote.confidence = parsed.confidence;
        vote.reasoning = parsed.reasoning;
        vote.weight = vote_weight(&self.weighting, &vote, seniority);
        vote
    }

    /// 并发调用各 agent，保留每个成功调用的原始输出
    async fn poll(
        &self,
        invoker: &AgentInvoker,
        inputs: Vec<(String, AgentInput)>,
        failed: &mut BTreeMap<String, String>,
    ) -> Vec<(String, AgentResponse)> {
        let calls = inputs
            .into_iter()
            .map(|(agent, input)| async move {
                let invocation = invoker.invoke(&agent, input).await;
                (agent, invocation.result)
            });
        let mut answered = Vec::new();
        for (agent, result) in join_all(calls).await {
            match result {
                Ok(response) => {
                    failed.remove(&agent);
                    answered.push((agent, response));
                }
                Err(err) => {
                    warn!(agent = %agent, error = %err, "decision participant failed");
                    failed.insert(agent, err.to_string());
                }
            }
        }
        answered
    }

    fn parse_votes(
        &self,
        answered: &[(String, AgentResponse)],
        failed: &mut BTreeMap<String, String>,
    ) -> Vec<Vote> {
        let mut votes = Vec::new();
        for (agent, response) in answered {
            match self.schema.parse(agent, response) {
                Ok(parsed) => votes.push(self.weigh(parsed, agent)),
                Err(err) => {
                    warn!(agent = %agent, error = %err, "vote excluded");
                    failed.insert(agent.clone(), err.to_string());
                }
            }
        }
        votes
    }

    async fn run_cio(&self, invoker: &AgentInvoker, base: &AgentInput) -> Result<Proposal> {
        let agent = self
            .agents
            .names()
            .first()
            .cloned()
            .ok_or_else(|| CrewError::InvalidConfiguration("cio decision has no agent".into()))?;
        let response = invoker.invoke(&agent, self.vote_input(base)).await.result?;
        let parsed = self.schema.parse(&agent, &response)?;
        let vote = self.weigh(parsed, &agent);
        Ok(Proposal {
            decision: vote.decision.clone(),
            confidence: vote.confidence.unwrap_or(1.0),
            level: ConsensusLevel::Unanimous,
            distribution: BTreeMap::from([(vote.decision.clone(), 1.0)]),
            votes: vec![vote],
            failed_agents: BTreeMap::new(),
            rounds: 1,
        })
    }

    async fn run_ballot(&self, invoker: &AgentInvoker, base: &AgentInput) -> Result<Proposal> {
        let mut failed = BTreeMap::new();
        let inputs = self
            .participants()
            .into_iter()
            .map(|agent| (agent, self.vote_input(base)))
            .collect();
        let answered = self.poll(invoker, inputs, &mut failed).await;
        let votes = self.parse_votes(&answered, &mut failed);

        if votes.len() < self.minimum_votes {
            return Err(CrewError::QuorumNotMet {
                required: self.minimum_votes,
                received: votes.len(),
            });
        }
        let Some(count) = tally(&votes) else {
            return Err(CrewError::QuorumNotMet {
                required: self.minimum_votes,
                received: 0,
            });
        };
        debug!(winner = %count.winner, share = count.share, "ballot tallied");

        Ok(Proposal {
            confidence: count.share * winner_confidence(&votes, &count.winner),
            decision: count.winner,
            level: count.level,
            votes,
            distribution: count.distribution,
            failed_agents: failed,
            rounds: 1,
        })
    }

    async fn run_consensus(&self, invoker: &AgentInvoker, base: &AgentInput) -> Result<Proposal> {
        let coordinator = self
            .coordinator
            .clone()
            .ok_or_else(|| CrewError::InvalidConfiguration("consensus decision has no coordinator".into()))?;
        let participants = self.participants();
        let mut failed = BTreeMap::new();

        let opening = participants
            .iter()
            .map(|agent| (agent.clone(), self.vote_input(base)))
            .collect();
        let mut answered = self.poll(invoker, opening, &mut failed).await;

        for round in 1..=self.rounds {
            let latest: HashMap<String, String> = answered
                .iter()
                .map(|(agent, response)| (agent.clone(), response.output.clone()))
                .collect();
            debug!(round, answered = latest.len(), "cross-pollination round");
            let inputs = participants
                .iter()
                .map(|agent| {
                    let mut input = self.vote_input(base);
                    input.instruction = input
                        .instruction
                        .map(|text| format!("{REVISE_INSTRUCTION}\n\n{text}"));
                    for peer in &participants {
                        if peer == agent {
                            continue;
                        }
                        if let Some(output) = latest.get(peer) {
                            input = input.with_upstream(peer.clone(), output.clone());
                        }
                    }
                    (agent.clone(), input)
                })
                .collect();
            answered = self.poll(invoker, inputs, &mut failed).await;
        }

        if answered.is_empty() {
            return Err(CrewError::QuorumNotMet {
                required: 1,
                received: 0,
            });
        }
        let votes = self.parse_votes(&answered, &mut failed);

        let mut synthesis = AgentInput::new(base.query.clone())
            .with_instruction(format!("{SYNTHESIZE_INSTRUCTION}\n\n{}", self.schema.instruction()))
            .with_schema(self.schema.to_json_schema());
        for (agent, response) in &answered {
            synthesis = synthesis.with_upstream(agent.clone(), response.output.clone());
        }
        let response = invoker.invoke(&coordinator, synthesis).await.result?;
        let parsed = self.schema.parse(&coordinator, &response)?;

        let count = tally(&votes);
        let share = count
            .as_ref()
            .and_then(|count| {
                count
                    .distribution
                    .iter()
                    .find(|(decision, _)| decision.eq_ignore_ascii_case(&parsed.decision))
                    .map(|(_, share)| *share)
            })
            .unwrap_or(0.0);
        let level = match &count {
            Some(count) if count.winner.eq_ignore_ascii_case(&parsed.decision) => count.level,
            Some(_) => consensus_level(share, None),
            None => ConsensusLevel::Divided,
        };

        Ok(Proposal {
            confidence: parsed.confidence.unwrap_or(share),
            decision: parsed.decision,
            level,
            votes,
            distribution: count.map(|count| count.distribution).unwrap_or_default(),
            failed_agents: failed,
            rounds: 1 + self.rounds,
        })
    }

    async fn finish(&self, question: &str, proposal: Proposal) -> DecisionResult {
        let mut result = DecisionResult {
            final_decision: proposal.decision,
            consensus_level: proposal.level,
            votes: proposal.votes,
            confidence: proposal.confidence,
            escalated: false,
            mode: self.mode,
            failed_agents: proposal.failed_agents,
            distribution: proposal.distribution,
            rounds: proposal.rounds,
            escalation: None,
        };

        let Some(policy) = &self.escalation else {
            return result;
        };
        let Some(reason) = policy.trigger(result.confidence, result.consensus_level) else {
            return result;
        };
        info!(reason = ?reason, targets = ?policy.target_humans, "escalating decision");
        let request = EscalationRequest {
            node: self.name.clone(),
            question: question.to_string(),
            mode: self.mode,
            proposed_decision: result.final_decision.clone(),
            consensus_level: result.consensus_level,
            confidence: result.confidence,
            reason,
            votes: result.votes.clone(),
        };
        let outcome = policy.escalate(self.channel.as_ref(), &request).await;
        if let Some(decision) = &outcome.decision {
            result.final_decision = decision.clone();
            if matches!(outcome.resolution, EscalationResolution::Human { .. }) {
                result.confidence = 1.0;
            }
        }
        result.escalated = true;
        result.escalation = Some(outcome);
        result
    }
}

/// 胜出方投票者报告置信度的均值；未报告按 1.0 计
fn winner_confidence(votes: &[Vote], winner: &str) -> f64 {
    let backing: Vec<f64> = votes
        .iter()
        .filter(|vote| vote.decision.eq_ignore_ascii_case(winner))
        .map(|vote| vote.confidence.unwrap_or(1.0))
        .collect();
    if backing.is_empty() {
        return 0.0;
    }
    backing.iter().sum::<f64>() / backing.len() as f64
}

#[async_trait]
impl Agent for DecisionFlowNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn invoke(&self, input: AgentInput, ctx: &AgentContext<'_>) -> Result<AgentResponse> {
        let query = input.query.clone();
        let result = self
            .decide(input, ctx.flow().fork(query.clone()), ExecutionMemory::new(query))
            .await?;
        let structured = serde_json::to_value(&result)?;
        Ok(AgentResponse::text(result.final_decision.clone())
            .with_structured(structured)
            .with_metadata("mode", json!(self.mode))
            .with_metadata("consensus_level", json!(result.consensus_level))
            .with_metadata("escalated", json!(result.escalated))
            .with_shared(format!("{}_decision", self.name), json!(result.final_decision)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;

    fn voter(name: &str, answer: &'static str) -> Arc<dyn Agent> {
        Arc::new(FnAgent::new(name, move |_input: AgentInput| {
            Ok(AgentResponse::text(answer))
        }))
    }

    #[tokio::test]
    async fn cio_takes_the_single_answer() {
        let node = DecisionFlowNode::cio(
            "gate",
            voter("chief", r#"{"decision": "ship", "confidence": 0.9}"#),
        )
        .unwrap();
        let result = node.ask("release?").await.unwrap();
        assert_eq!(result.final_decision, "ship");
        assert_eq!(result.consensus_level, ConsensusLevel::Unanimous);
        assert_eq!(result.confidence, 0.9);
        assert!(!result.escalated);
    }

    #[tokio::test]
    async fn configuration_is_checked_before_any_call() {
        let node = DecisionFlowNode::ballot("vote", [voter("only", "{}")]).unwrap();
        assert!(matches!(
            node.ask("q").await,
            Err(CrewError::InvalidConfiguration(_))
        ));

        let node = DecisionFlowNode::consensus("deliberate", voter("lead", "{}"), [voter("a", "{}")])
            .unwrap();
        assert!(matches!(
            node.ask("q").await,
            Err(CrewError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn vote_input_carries_schema_and_instruction() {
        let node = DecisionFlowNode::new("gate", DecisionMode::Ballot)
            .with_schema(DecisionSchema::new().with_allowed_values(["yes", "no"]));
        let input = node.vote_input(&AgentInput::new("q").with_instruction("be strict"));
        let instruction = input.instruction.unwrap();
        assert!(instruction.starts_with("be strict"));
        assert!(instruction.contains("yes, no"));
        assert!(input.output_schema.is_some());
    }
}
