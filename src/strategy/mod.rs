//! 决策策略
//!
//! 策略是封闭枚举 + 工厂函数：新增策略加一个变体，不做动态注册。
//! 当前唯一实现是 heuristic_first（够自信的启发式直接赢，否则把
//! 候选递给推理端）。

pub mod heuristic_first;

use std::sync::Arc;

use crate::config::StrategySection;
use crate::event::Event;
use crate::learning::LearningEngine;
use crate::llm::embedding::EmbeddingProvider;
use crate::llm::Reasoner;
use crate::salience::SalienceResult;
use crate::storage::CandidateHeuristic;

pub use heuristic_first::HeuristicFirst;

/// 决策走过的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPath {
    /// 启发式短路，推理端未被调用
    Heuristic,
    /// 推理端给出响应
    Llm,
    /// 推理端无输出，使用兜底文案
    Fallback,
    /// 不符合同步决策条件（文本为空或无推理端）
    Rejected,
}

/// 一次决策的结论
#[derive(Debug, Clone)]
pub struct Decision {
    pub path: DecisionPath,
    /// Rejected 时为 None，由队列合成哨兵响应
    pub text: Option<String>,
    pub matched_heuristic_id: Option<String>,
    pub predicted_success: f64,
    pub confidence: f64,
}

impl Decision {
    fn rejected() -> Self {
        Self {
            path: DecisionPath::Rejected,
            text: None,
            matched_heuristic_id: None,
            predicted_success: 0.0,
            confidence: 0.0,
        }
    }
}

/// 决策输入：事件 + 路由收集的候选与显著度
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub event: Event,
    /// 缓存/存储给出的最佳匹配
    pub suggestion: Option<CandidateHeuristic>,
    /// 次级候选
    pub candidates: Vec<CandidateHeuristic>,
    pub salience: SalienceResult,
}

/// 封闭的策略枚举
pub enum DecisionStrategy {
    HeuristicFirst(HeuristicFirst),
}

impl DecisionStrategy {
    pub async fn decide(&self, ctx: &DecisionContext) -> Decision {
        match self {
            Self::HeuristicFirst(s) => s.decide(ctx).await,
        }
    }

    /// 中止并等待还在跑的强化任务
    pub async fn shutdown(&self) {
        match self {
            Self::HeuristicFirst(s) => s.shutdown().await,
        }
    }
}

/// 有效接受阈值：基础阈值加人格偏置，钳制在 [0.3, 0.95]
pub fn effective_threshold(config: &StrategySection) -> f64 {
    (config.base_threshold + config.personality_bias).clamp(0.3, 0.95)
}

/// 按配置选择策略；未知名称回落到 heuristic_first
pub fn create_strategy(
    config: &StrategySection,
    system_prompt: &str,
    reasoner: Option<Arc<dyn Reasoner>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    learning: Arc<LearningEngine>,
) -> DecisionStrategy {
    match config.name.as_str() {
        "heuristic_first" => {}
        other => {
            tracing::warn!(strategy = %other, "unknown strategy name, using heuristic_first");
        }
    }
    DecisionStrategy::HeuristicFirst(HeuristicFirst::new(
        config.clone(),
        system_prompt.to_string(),
        reasoner,
        embedder,
        learning,
    ))
}
