//! 启发式存储抽象
//!
//! 存储是置信度的唯一权威：每次置信度变更都是存储内部的一次
//! 原子读-改-写，任何组件不得把本地副本写回。当前提供内存实现，
//! 换用外部数据库时实现同一 trait 即可。

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::event::AssistantResponse;

pub use memory::MemoryStore;

/// 启发式的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeuristicOrigin {
    /// 运行期学到的
    Learned,
    /// 预置规则
    Seeded,
    /// 外部导入
    Imported,
}

/// 置信度更新的来源标签（随更新落日志，便于审计反馈回路）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackSource {
    /// 用户显式反馈
    Explicit,
    /// 时限内无人反对，视为隐式成功
    ImplicitTimeout,
    /// 撤销关键词触发的隐式失败
    ImplicitUndo,
    /// 反复无视触发的隐式失败
    ImplicitIgnored,
    /// 推理端输出与候选动作高度相似（隐式背书）
    LlmEndorsement,
    /// 结果模式命中（按模式极性定成败）
    ObservedOutcome,
}

/// 学到的条件→动作规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heuristic {
    /// 启发式 ID
    pub id: String,
    /// 条件文本（与事件文本做词面/语义匹配）
    pub condition: String,
    /// 序列化的动作/效果
    pub action: serde_json::Value,
    /// 置信度，始终在 [0,1]
    pub confidence: f64,
    /// 被选中产生响应的次数
    pub fire_count: u64,
    /// 获得正向证据的次数
    pub success_count: u64,
    /// 来源
    pub origin: HeuristicOrigin,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl Heuristic {
    pub fn new(condition: impl Into<String>, action: serde_json::Value) -> Self {
        Self {
            id: format!("heu_{}", uuid::Uuid::new_v4()),
            condition: condition.into(),
            action,
            confidence: 0.5,
            fire_count: 0,
            success_count: 0,
            origin: HeuristicOrigin::Learned,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_origin(mut self, origin: HeuristicOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// 单次决策用的候选视图，从不持久化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateHeuristic {
    pub id: String,
    pub condition: String,
    pub action: serde_json::Value,
    pub confidence: f64,
    /// 与事件文本的相似度
    pub similarity: f64,
}

impl CandidateHeuristic {
    /// 动作的展示文本：字符串动作直接取值，其余紧凑序列化
    pub fn action_text(&self) -> String {
        action_text(&self.action)
    }
}

/// fire 记录：某次事件由某条启发式产生了响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRecord {
    pub id: String,
    pub heuristic_id: String,
    pub event_id: String,
    /// 毫秒时间戳
    pub fired_at: i64,
}

/// 动作 JSON 的展示文本
pub fn action_text(action: &serde_json::Value) -> String {
    match action {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 启发式存储 trait
#[async_trait]
pub trait HeuristicStore: Send + Sync {
    /// 按 ID 取启发式；未知 ID 返回 NotFound
    async fn get_heuristic(&self, id: &str) -> Result<Heuristic>;

    /// 写入（或覆盖）一条启发式
    async fn put_heuristic(&self, heuristic: Heuristic) -> Result<()>;

    /// 按文本查候选：置信度需大于 min_confidence，按相似度降序，截断到 limit
    async fn query_candidates(
        &self,
        text: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<CandidateHeuristic>>;

    /// 加权置信度更新：一次原子读-改-写，返回 (旧值, 新值)，结果钳制在 [0,1]
    async fn update_confidence(
        &self,
        id: &str,
        positive: bool,
        magnitude: f64,
        source: FeedbackSource,
    ) -> Result<(f64, f64)>;

    /// 记录一次 fire，返回 fire ID
    async fn record_fire(&self, heuristic_id: &str, event_id: &str) -> Result<String>;

    /// 记录一条终局响应
    async fn record_response(&self, response: &AssistantResponse) -> Result<()>;

    /// 查某事件的全部响应（观测/测试用）
    async fn responses_for(&self, event_id: &str) -> Result<Vec<AssistantResponse>>;
}
