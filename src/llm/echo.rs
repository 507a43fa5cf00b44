use async_trait::async_trait;

use super::client::LlmClient;
use super::types::{LlmRequest, LlmResponse};
use crate::error::Result;

#[derive(Default, Clone)]
pub struct LocalEchoClient;

#[async_trait]
impl LlmClient for LocalEchoClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse {
            content: format!("[Echo] {last}"),
            model: Some("local-echo".to_string()),
            ..LlmResponse::default()
        })
    }

    fn model(&self) -> Option<&str> {
        Some("local-echo")
    }
}
