mod client;
mod echo;
mod types;

pub use client::{DynLlmClient, LlmClient};
pub use echo::LocalEchoClient;
pub use types::{LlmMessage, LlmRequest, LlmResponse, LlmToolCall};
