//! 事件与响应模型
//!
//! Event 创建后不可变，由当前持有它的组件独占（路由器 → 队列 → worker）。
//! AssistantResponse 是每个被接纳事件的唯一终局产物：启发式、LLM、降级、
//! 哨兵（无推理端）、超时或清空，六者有且只有其一。

use serde::{Deserialize, Serialize};

use crate::salience::SalienceResult;

/// 事件 ID
pub type EventId = String;

/// 入站事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件 ID
    pub id: EventId,
    /// 来源（传感器/适配器名，订阅过滤用）
    pub source: String,
    /// 原始文本
    pub text: String,
    /// 外部预先算好的显著性（提供时路由器直接采用）
    pub salience: Option<SalienceResult>,
    /// 查询时跳过语义匹配（只走词面命中，省一次嵌入调用）
    pub skip_semantic: bool,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl Event {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            source: source.into(),
            text: text.into(),
            salience: None,
            skip_semantic: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_salience(mut self, salience: SalienceResult) -> Self {
        self.salience = Some(salience);
        self
    }

    pub fn with_skip_semantic(mut self, skip: bool) -> Self {
        self.skip_semantic = skip;
        self
    }
}

/// 响应的产生路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// 启发式短路（缓存或候选直接命中）
    Heuristic,
    /// 推理端生成
    Llm,
    /// 推理端无输出，降级文案
    Fallback,
    /// 未配置推理端的哨兵响应
    NoReasoner,
    /// SLA 超时哨兵
    Timeout,
    /// 队列清空哨兵
    Flushed,
    /// 紧急快路（绕过队列）
    Emergency,
}

/// 助手响应：存储后广播给订阅者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantResponse {
    /// 响应 ID
    pub id: String,
    /// 对应的事件 ID
    pub event_id: EventId,
    /// 事件来源（订阅过滤沿用）
    pub source: String,
    /// 响应文本
    pub text: String,
    /// 产生路径
    pub kind: ResponseKind,
    /// 命中的启发式 ID（启发式/紧急路径时有值）
    pub matched_heuristic_id: Option<String>,
    /// 命中启发式的置信度（无命中为 0）
    pub confidence: f64,
    /// 预估成功率
    pub predicted_success: f64,
    /// 是否经由缓存子系统命中
    pub from_cache: bool,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl AssistantResponse {
    pub fn new(event: &Event, text: impl Into<String>, kind: ResponseKind) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4()),
            event_id: event.id.clone(),
            source: event.source.clone(),
            text: text.into(),
            kind,
            matched_heuristic_id: None,
            confidence: 0.0,
            predicted_success: 0.0,
            from_cache: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_heuristic(mut self, heuristic_id: impl Into<String>, confidence: f64) -> Self {
        self.matched_heuristic_id = Some(heuristic_id.into());
        self.confidence = confidence;
        self
    }

    pub fn with_predicted_success(mut self, predicted: f64) -> Self {
        self.predicted_success = predicted;
        self
    }

    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }
}
