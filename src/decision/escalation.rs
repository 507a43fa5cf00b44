use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

use super::types::{ConsensusLevel, DecisionMode, Vote};

/// 人工审批通道
///
/// 实现方将请求送达 `target`，并可选择等待
/// 答复。引擎以策略超时限制等待时间
#[async_trait]
pub trait HumanChannel: Send + Sync {
    async fn notify(&self, target: &str, request: &EscalationRequest) -> Result<Option<HumanResponse>>;
}

pub type DynHumanChannel = Arc<dyn HumanChannel>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub node: String,
    pub question: String,
    pub mode: DecisionMode,
    pub proposed_decision: String,
    pub consensus_level: ConsensusLevel,
    pub confidence: f64,
    pub reason: EscalationReason,
    pub votes: Vec<Vote>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub responder: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence,
    SplitVote,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationResolution {
    Human { responder: String },
    Fallback,
    /// 无答复且无兜底；维持提议的决策
    Unresolved,
}

/// 升级记录，写入 `DecisionResult::escalation`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub reason: EscalationReason,
    pub targets: Vec<String>,
    pub proposed_decision: String,
    pub resolution: EscalationResolution,
    /// 替换提议的决策（如有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// 升级策略
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[serde(default)]
    pub on_low_confidence: Option<f64>,
    #[serde(default)]
    pub on_split_vote: bool,
    #[serde(default)]
    pub target_humans: Vec<String>,
    #[serde(default)]
    pub fallback_decision: Option<String>,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            on_low_confidence: None,
            on_split_vote: false,
            target_humans: Vec::new(),
            fallback_decision: None,
            timeout: default_timeout(),
        }
    }
}

impl EscalationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_low_confidence(mut self, threshold: f64) -> Self {
        self.on_low_confidence = Some(threshold);
        self
    }

    pub fn on_split_vote(mut self) -> Self {
        self.on_split_vote = true;
        self
    }

    pub fn notify<S: Into<String>>(mut self, target: S) -> Self {
        self.target_humans.push(target.into());
        self
    }

    pub fn with_fallback(mut self, decision: impl Into<String>) -> Self {
        self.fallback_decision = Some(decision.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn trigger(&self, confidence: f64, level: ConsensusLevel) -> Option<EscalationReason> {
        if let Some(threshold) = self.on_low_confidence {
            if confidence < threshold {
                return Some(EscalationReason::LowConfidence);
            }
        }
        if self.on_split_vote && level.is_split() {
            return Some(EscalationReason::SplitVote);
        }
        None
    }

    /// 依次询问每个 target 直到有人答复；整个过程
    /// 受 `timeout` 限制
    pub(crate) async fn escalate(
        &self,
        channel: Option<&DynHumanChannel>,
        request: &EscalationRequest,
    ) -> EscalationOutcome {
        let answer = match channel {
            Some(channel) => {
                let ask_all = async {
                    for target in &self.target_humans {
                        match channel.notify(target, request).await {
                            Ok(Some(response)) => return Some(response),
                            Ok(None) => {}
                            Err(err) => {
                                warn!(node = %request.node, target = %target, error = %err, "human channel failed")
                            }
                        }
                    }
                    None
                };
                match tokio::time::timeout(self.timeout, ask_all).await {
                    Ok(answer) => answer,
                    Err(_) => {
                        warn!(node = %request.node, timeout = ?self.timeout, "no human response before timeout");
                        None
                    }
                }
            }
            None => None,
        };

        let (resolution, decision, comment) = match answer {
            Some(response) => {
                info!(node = %request.node, responder = %response.responder, decision = %response.decision, "human resolved escalation");
                (
                    EscalationResolution::Human {
                        responder: response.responder,
                    },
                    Some(response.decision),
                    response.comment,
                )
            }
            None => match &self.fallback_decision {
                Some(fallback) => (EscalationResolution::Fallback, Some(fallback.clone()), None),
                None => (EscalationResolution::Unresolved, None, None),
            },
        };

        EscalationOutcome {
            reason: request.reason,
            targets: self.target_humans.clone(),
            proposed_decision: request.proposed_decision.clone(),
            resolution,
            decision,
            comment,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}
