use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CrewError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpstreamOutput {
    pub agent: String,
    pub output: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentInput {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream: Vec<UpstreamOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub attempt: u32,
}

impl AgentInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_upstream(mut self, agent: impl Into<String>, output: impl Into<String>) -> Self {
        self.upstream.push(UpstreamOutput {
            agent: agent.into(),
            output: output.into(),
        });
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// 将输入展开为交给 LLM 的文本
    pub fn render(&self) -> String {
        let mut text = self.query.clone();
        if let Some(instruction) = &self.instruction {
            text.push_str("\n\nInstruction: ");
            text.push_str(instruction);
        }
        if let Some(error) = &self.error {
            text.push_str("\n\nPrevious error: ");
            text.push_str(error);
        }
        if !self.upstream.is_empty() {
            text.push_str("\n\nContext from previous agents:");
            for entry in &self.upstream {
                text.push_str(&format!("\n[{}]: {}", entry.agent, entry.output));
            }
        }
        text
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// agent 结束后由引擎合并进 `FlowContext::shared_data` 的条目
    #[serde(default)]
    pub shared_updates: Map<String, Value>,
}

impl AgentResponse {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured = Some(value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tool_call(mut self, record: ToolCallRecord) -> Self {
        self.tool_calls.push(record);
        self
    }

    pub fn with_shared(mut self, key: impl Into<String>, value: Value) -> Self {
        self.shared_updates.insert(key.into(), value);
        self
    }

    pub fn try_decode<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match &self.structured {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CrewError::Serialization(e.to_string())),
            None => serde_json::from_str(&self.output)
                .map_err(|e| CrewError::Serialization(e.to_string())),
        }
    }
}

pub fn uuid() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", now.as_secs(), now.subsec_nanos(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_includes_every_section() {
        let input = AgentInput::new("summarize the report")
            .with_instruction("be brief")
            .with_error("timeout")
            .with_upstream("writer", "draft v1");
        let text = input.render();
        assert!(text.starts_with("summarize the report"));
        assert!(text.contains("Instruction: be brief"));
        assert!(text.contains("Previous error: timeout"));
        assert!(text.contains("[writer]: draft v1"));
    }

    #[test]
    fn decode_prefers_structured_payload() {
        #[derive(Deserialize)]
        struct Verdict {
            decision: String,
        }
        let response =
            AgentResponse::text("not json").with_structured(json!({ "decision": "ship" }));
        let verdict: Verdict = response.try_decode().unwrap();
        assert_eq!(verdict.decision, "ship");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(uuid(), uuid());
    }
}
