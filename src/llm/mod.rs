//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError, TokenUsage};

use crate::config::LlmSection;

/// 按 [llm].provider 创建客户端：mock 用于本地联调，其余一律走 OpenAI 兼容端点
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using mock LLM client");
            Arc::new(MockLlmClient::new())
        }
        other => {
            tracing::info!(provider = %other, model = %section.model, "Using OpenAI-compatible LLM client");
            Arc::new(OpenAiClient::from_config(section))
        }
    }
}
