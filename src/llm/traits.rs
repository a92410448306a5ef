//! 推理端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 Reasoner：单次 prompt → 文本。
//! `Ok(None)` 表示推理端正常返回但没有产出内容，调用方据此走降级路径。

use async_trait::async_trait;
use thiserror::Error;

/// LLM 层错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Empty embedding")]
    EmptyEmbedding,
}

/// 期望的输出形态
///
/// Json 为尽力而为：通过提示词约束输出，不保证可解析，调用方需容错。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// 推理端 trait：生成一段响应文本
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// 生成响应；`Ok(None)` 表示无产出
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        format: OutputFormat,
    ) -> Result<Option<String>, LlmError>;

    /// 累计调用次数，默认 0，具体实现可覆盖
    fn call_count(&self) -> u64 {
        0
    }
}
