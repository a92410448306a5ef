//! 核心错误类型
//!
//! 与各组件的降级策略配合：not-found 返回结构化错误，推理/嵌入不可用走降级路径，
//! 存储失败仅记日志不向上传播（广播不依赖持久化成功）。

use thiserror::Error;

/// 决策核心运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Reasoner unavailable")]
    ReasonerUnavailable,

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, CoreError>;
