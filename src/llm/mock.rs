//! Mock 推理端与嵌入端（用于测试与离线运行，无需 API）
//!
//! MockReasoner 按脚本出队回复，脚本耗尽后回显或返回无产出；
//! MockEmbedder 用词袋哈希桶生成确定性向量，相似文本得到相近向量。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::embedding::EmbeddingProvider;
use crate::llm::traits::{LlmError, OutputFormat, Reasoner};

/// Mock 推理端：按脚本回复，可选回显模式
#[derive(Default)]
pub struct MockReasoner {
    replies: Mutex<VecDeque<String>>,
    echo: bool,
    calls: AtomicU64,
}

impl MockReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 回显模式：脚本耗尽后回显 prompt 首行
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// 追加一条脚本回复（按入队顺序出队）
    pub fn with_reply(mut self, text: impl Into<String>) -> Self {
        self.replies.get_mut().push_back(text.into());
        self
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn generate(
        &self,
        prompt: &str,
        _system_prompt: Option<&str>,
        _format: OutputFormat,
    ) -> Result<Option<String>, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(reply) = self.replies.lock().await.pop_front() {
            return Ok(Some(reply));
        }

        if self.echo {
            let first_line = prompt.lines().next().unwrap_or("(no input)");
            return Ok(Some(format!("Echo from Mock: {}", first_line)));
        }

        Ok(None)
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Mock 嵌入端：小写分词 → 哈希桶累加 → 定长向量
///
/// 同一进程内对相同文本完全确定，词重叠度直接反映为余弦相似度。
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dims: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self { dims: 64 }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyEmbedding);
        }

        let mut v = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.len() < 2 {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dims;
            v[idx] += 1.0;
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_mock_reasoner_scripted_replies() {
        let reasoner = MockReasoner::new().with_reply("first").with_reply("second");
        let a = reasoner.generate("p", None, OutputFormat::Text).await.unwrap();
        let b = reasoner.generate("p", None, OutputFormat::Text).await.unwrap();
        let c = reasoner.generate("p", None, OutputFormat::Text).await.unwrap();
        assert_eq!(a.as_deref(), Some("first"));
        assert_eq!(b.as_deref(), Some("second"));
        assert!(c.is_none());
        assert_eq!(reasoner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_reasoner_echo() {
        let reasoner = MockReasoner::echo();
        let out = reasoner
            .generate("hello world\nsecond line", None, OutputFormat::Text)
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("Echo from Mock: hello world"));
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new();
        let a = embedder.embed("low health detected").await.unwrap();
        let b = embedder.embed("low health detected").await.unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_mock_embedder_overlap_similarity() {
        let embedder = MockEmbedder::new();
        let a = embedder.embed("battery level critical").await.unwrap();
        let b = embedder.embed("critical battery level now").await.unwrap();
        let c = embedder.embed("weekly gardening newsletter").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert!(cosine_similarity(&a, &b) > 0.7);
    }

    #[tokio::test]
    async fn test_mock_embedder_rejects_empty() {
        let embedder = MockEmbedder::new();
        assert!(embedder.embed("   ").await.is_err());
    }
}
