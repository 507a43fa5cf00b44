use std::collections::BTreeMap;

use super::types::{ConsensusLevel, Vote, VoteWeighting};

const EPSILON: f64 = 1e-9;

/// `Confidence` 权重下，未报告置信度的投票所得权重
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

/// 计票结果
#[derive(Clone, Debug, PartialEq)]
pub struct Tally {
    pub winner: String,
    /// 胜出选项占总权重的比例
    pub share: f64,
    pub level: ConsensusLevel,
    pub distribution: BTreeMap<String, f64>,
}

/// 单张投票的权重。`seniority` 是 agent 在参与者中的注册序号
pub fn vote_weight(weighting: &VoteWeighting, vote: &Vote, seniority: usize) -> f64 {
    match weighting {
        VoteWeighting::Equal => 1.0,
        VoteWeighting::Custom(weights) => weights.get(&vote.agent).copied().unwrap_or(1.0),
        VoteWeighting::Seniority => 1.0 / (seniority as f64 + 1.0),
        VoteWeighting::Confidence => vote.confidence.unwrap_or(NEUTRAL_CONFIDENCE),
    }
}

/// 将一致比例映射到共识等级
///
/// 无论有多少选项，并列第一即为僵局
pub fn consensus_level(top_share: f64, runner_up_share: Option<f64>) -> ConsensusLevel {
    if let Some(runner_up) = runner_up_share {
        if (top_share - runner_up).abs() < EPSILON {
            return ConsensusLevel::Deadlock;
        }
    }
    if top_share >= 1.0 - EPSILON {
        ConsensusLevel::Unanimous
    } else if top_share >= 0.8 - EPSILON {
        ConsensusLevel::StrongMajority
    } else if top_share >= 0.6 - EPSILON {
        ConsensusLevel::Majority
    } else {
        ConsensusLevel::Divided
    }
}

/// 统计按注册顺序给出的加权投票
///
/// 并列第一时取最早投票者选择的选项
/// 所有权重均为零时按等权计票
pub fn tally(votes: &[Vote]) -> Option<Tally> {
    if votes.is_empty() {
        return None;
    }
    let total: f64 = votes.iter().map(|vote| vote.weight.max(0.0)).sum();
    let equal = total <= EPSILON;
    let total = if equal { votes.len() as f64 } else { total };

    let mut options: Vec<(String, f64)> = Vec::new();
    for vote in votes {
        let weight = if equal { 1.0 } else { vote.weight.max(0.0) };
        match options.iter_mut().find(|(decision, _)| decision.eq_ignore_ascii_case(&vote.decision)) {
            Some((_, sum)) => *sum += weight,
            None => options.push((vote.decision.clone(), weight)),
        }
    }

    // 稳定排序，权重相同时保留最早投票者的顺序
    let mut ranked = options.clone();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (winner, top) = ranked[0].clone();
    let runner_up = ranked.get(1).map(|(_, weight)| weight / total);
    let share = top / total;

    Some(Tally {
        winner,
        share,
        level: consensus_level(share, runner_up),
        distribution: options
            .into_iter()
            .map(|(decision, weight)| (decision, weight / total))
            .collect(),
    })
}
