use std::sync::Arc;

use async_trait::async_trait;

use super::types::{LlmRequest, LlmResponse};
use crate::error::Result;

/// 对话补全能力。具体厂商的客户端不在本 crate 内
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;

    fn model(&self) -> Option<&str> {
        None
    }
}

pub type DynLlmClient = Arc<dyn LlmClient>;
