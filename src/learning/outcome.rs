//! 结果观察：fire 之后盯住后续事件流里的可观测结果
//!
//! 配置里的结果模式声明「触发词 → 预期词」：某条启发式的条件文本
//! 含触发词时，为这次 fire 登记一个待决结果（每次 fire 至多一个，
//! 取第一个命中的模式）。预期词出现即按模式极性结案；超时未出现
//! 由清理器按隐式成功结案。

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::OutcomePatternConfig;

/// 结果模式
#[derive(Debug, Clone)]
pub struct OutcomePattern {
    /// 条件文本包含它才登记（小写匹配）
    pub trigger: String,
    /// 后续事件包含它即结案（小写匹配）
    pub expected: String,
    /// 观察时限
    pub timeout: Duration,
    /// 预期词出现算成功还是失败
    pub success: bool,
}

impl OutcomePattern {
    pub fn from_config(config: &OutcomePatternConfig) -> Self {
        Self {
            trigger: config.trigger.to_lowercase(),
            expected: config.expected.to_lowercase(),
            timeout: Duration::from_secs(config.timeout_secs),
            success: config.success,
        }
    }
}

/// 待决结果
#[derive(Debug, Clone)]
pub struct PendingOutcome {
    pub heuristic_id: String,
    pub event_id: String,
    /// 预期词（小写）
    pub expected: String,
    pub registered_at: Instant,
    pub deadline: Instant,
    /// fire 时策略给出的成功预估（结案日志用）
    pub predicted_success: f64,
    /// 预期词出现时的极性
    pub success: bool,
}

/// 结果观察器
pub struct OutcomeWatcher {
    patterns: Vec<OutcomePattern>,
    pending: Mutex<Vec<PendingOutcome>>,
}

impl OutcomeWatcher {
    pub fn new(patterns: Vec<OutcomePattern>) -> Self {
        Self {
            patterns,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// 为一次 fire 登记待决结果；无模式命中时返回 false
    pub async fn register_fire(
        &self,
        heuristic_id: &str,
        event_id: &str,
        condition_text: &str,
        predicted_success: f64,
    ) -> bool {
        let condition_lower = condition_text.to_lowercase();
        let pattern = self
            .patterns
            .iter()
            .find(|p| !p.trigger.is_empty() && condition_lower.contains(&p.trigger));
        let Some(pattern) = pattern else {
            return false;
        };
        let now = Instant::now();
        let outcome = PendingOutcome {
            heuristic_id: heuristic_id.to_string(),
            event_id: event_id.to_string(),
            expected: pattern.expected.clone(),
            registered_at: now,
            deadline: now + pattern.timeout,
            predicted_success,
            success: pattern.success,
        };
        tracing::debug!(
            heuristic_id = %heuristic_id,
            expected = %outcome.expected,
            timeout_secs = pattern.timeout.as_secs(),
            "pending outcome registered"
        );
        self.pending.lock().await.push(outcome);
        true
    }

    /// 取走所有被该事件文本结案的待决结果（移除即幂等）
    pub async fn resolve_matching(&self, event_text: &str) -> Vec<PendingOutcome> {
        let text_lower = event_text.to_lowercase();
        let mut pending = self.pending.lock().await;
        let mut resolved = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if text_lower.contains(&pending[i].expected) {
                resolved.push(pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
        resolved
    }

    /// 取走所有已过期的待决结果
    pub async fn take_expired(&self) -> Vec<PendingOutcome> {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let mut expired = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].deadline <= now {
                expired.push(pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
