use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentResponse;
use crate::error::{CrewError, Result};

/// 决策输出的结构约束
///
/// 只读取 agent 输出中的 `decision`、`confidence` 与 `reasoning`，
/// 其他字段忽略。值不做强制转换：缺失或
/// 非字符串的 decision、非数值或越界的 confidence、或不在
/// `allowed_values` 中的值都会使整个输出被拒绝
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    #[serde(default)]
    pub require_confidence: bool,
}

/// 解析后的决策
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedDecision {
    pub decision: String,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

impl DecisionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn requiring_confidence(mut self) -> Self {
        self.require_confidence = true;
        self
    }

    /// 通过 `AgentInput::output_schema` 交给 agent 的 JSON schema
    pub fn to_json_schema(&self) -> Value {
        let mut decision = json!({ "type": "string" });
        if let Some(values) = &self.allowed_values {
            decision["enum"] = json!(values);
        }
        let mut required = vec!["decision"];
        if self.require_confidence {
            required.push("confidence");
        }
        json!({
            "type": "object",
            "properties": {
                "decision": decision,
                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                "reasoning": { "type": "string" }
            },
            "required": required
        })
    }

    pub fn instruction(&self) -> String {
        let mut text = String::from(
            "Reply with a JSON object: {\"decision\": string, \"confidence\": number between 0 and 1, \"reasoning\": string}.",
        );
        if let Some(values) = &self.allowed_values {
            text.push_str(&format!(" `decision` must be one of: {}.", values.join(", ")));
        }
        text
    }

    pub fn parse(&self, agent: &str, response: &AgentResponse) -> Result<ParsedDecision> {
        let value = match &response.structured {
            Some(value) => value.clone(),
            None => serde_json::from_str::<Value>(strip_fences(&response.output))
                .map_err(|err| invalid(agent, format!("output is not JSON: {err}")))?,
        };
        self.parse_value(agent, &value)
    }

    pub fn parse_value(&self, agent: &str, value: &Value) -> Result<ParsedDecision> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid(agent, "expected a JSON object"))?;

        let raw = match object.get("decision") {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim(),
            Some(Value::String(_)) => return Err(invalid(agent, "`decision` is empty")),
            Some(_) => return Err(invalid(agent, "`decision` must be a string")),
            None => return Err(invalid(agent, "missing `decision`")),
        };
        let decision = match &self.allowed_values {
            Some(values) => values
                .iter()
                .find(|allowed| allowed.eq_ignore_ascii_case(raw))
                .cloned()
                .ok_or_else(|| invalid(agent, format!("`{raw}` is not an allowed decision")))?,
            None => raw.to_string(),
        };

        let confidence = match object.get("confidence") {
            None | Some(Value::Null) if self.require_confidence => {
                return Err(invalid(agent, "missing `confidence`"))
            }
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => {
                let confidence = number
                    .as_f64()
                    .ok_or_else(|| invalid(agent, "`confidence` is not a finite number"))?;
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(invalid(agent, format!("`confidence` {confidence} is outside 0..=1")));
                }
                Some(confidence)
            }
            Some(_) => return Err(invalid(agent, "`confidence` must be a number")),
        };

        let reasoning = match object.get("reasoning") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(_) => return Err(invalid(agent, "`reasoning` must be a string")),
        };

        Ok(ParsedDecision {
            decision,
            confidence,
            reasoning,
        })
    }
}

fn invalid(agent: &str, reason: impl Into<String>) -> CrewError {
    CrewError::InvalidDecisionSchema {
        agent: agent.to_string(),
        reason: reason.into(),
    }
}

/// 去掉模型可能添加的 ```json 代码块包裹
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
