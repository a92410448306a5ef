//! LLM 层：推理端与嵌入端的抽象与实现（OpenAI 兼容 / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::ReasonerSection;

pub use embedding::{cosine_similarity, create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::{MockEmbedder, MockReasoner};
pub use openai::{OpenAiReasoner, TokenUsage};
pub use traits::{LlmError, OutputFormat, Reasoner};

/// 从应用配置创建推理端；provider 为 none 时返回 None（所有决策走降级/哨兵路径）
pub fn create_reasoner_from_config(section: &ReasonerSection) -> Option<Arc<dyn Reasoner>> {
    match section.provider.as_str() {
        "none" => None,
        "openai" => Some(Arc::new(OpenAiReasoner::new(
            section.base_url.as_deref(),
            &section.model,
            None,
        ))),
        _ => Some(Arc::new(MockReasoner::echo())),
    }
}
