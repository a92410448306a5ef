//! Reflex - 自我改进的通知决策核心
//!
//! 模块划分：
//! - **cache**: 启发式缓存（词面 / 语义匹配 + 存储回源）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与停机管理
//! - **event**: 事件与助手响应的数据模型
//! - **learning**: 反馈回路（显式反馈、撤销、忽略、结果观察）
//! - **llm**: 推理 / 嵌入客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 日志初始化
//! - **queue**: 带 SLA 超时的优先级事件队列与订阅分发
//! - **router**: 事件路由（显著性评分 + 紧急直通）
//! - **runtime**: 对外服务门面，负责装配各子系统
//! - **salience**: 多维显著性评分与习惯化
//! - **storage**: 启发式存储抽象与内存实现
//! - **strategy**: 决策策略（启发式优先 + LLM 兜底）

pub mod cache;
pub mod config;
pub mod core;
pub mod event;
pub mod learning;
pub mod llm;
pub mod observability;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod salience;
pub mod storage;
pub mod strategy;

pub use runtime::{PublishReceipt, ReflexRuntime};
