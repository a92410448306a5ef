//! 学习模块：五路反馈汇入同一条置信度更新原语
//!
//! 显式反馈、结果模式、观察超时、撤销、无视累计，全部折算成
//! 「方向 + 力度 + 来源」后交给存储做原子更新，更新完使缓存条目
//! 失效。模块自己从不计算新置信度。

pub mod outcome;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::cache::HeuristicCache;
use crate::config::LearningSection;
use crate::core::{CoreError, Result};
use crate::event::Event;
use crate::storage::{FeedbackSource, HeuristicStore};

use outcome::{OutcomePattern, OutcomeWatcher};

/// 反馈方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    Positive,
    Negative,
}

/// 一条反馈信号：构造后立即应用，从不存储
#[derive(Debug, Clone)]
pub struct FeedbackSignal {
    pub kind: FeedbackKind,
    pub heuristic_id: String,
    pub magnitude: f64,
    pub source: FeedbackSource,
}

/// 最近一次 fire 的轻量记录（撤销检测与事件→启发式回溯）
#[derive(Debug, Clone)]
struct RecentFire {
    heuristic_id: String,
    event_id: String,
    fired_at: Instant,
}

/// 无视计数状态
#[derive(Debug, Default, Clone, Copy)]
struct IgnoredState {
    count: u32,
    /// 已在阈值处发过一次负信号，等待显式反馈解冻
    fired: bool,
}

/// 学习引擎
pub struct LearningEngine {
    config: LearningSection,
    store: Arc<dyn HeuristicStore>,
    cache: Arc<HeuristicCache>,
    watcher: OutcomeWatcher,
    recent_fires: Mutex<VecDeque<RecentFire>>,
    ignored: Mutex<HashMap<String, IgnoredState>>,
}

impl LearningEngine {
    pub fn new(
        config: LearningSection,
        store: Arc<dyn HeuristicStore>,
        cache: Arc<HeuristicCache>,
    ) -> Self {
        let patterns: Vec<OutcomePattern> = config
            .outcome_patterns
            .iter()
            .map(OutcomePattern::from_config)
            .collect();
        Self {
            config,
            store,
            cache,
            watcher: OutcomeWatcher::new(patterns),
            recent_fires: Mutex::new(VecDeque::new()),
            ignored: Mutex::new(HashMap::new()),
        }
    }

    /// 用户显式反馈：按事件回溯启发式，施加大力度更新并解冻无视计数
    pub async fn on_feedback(&self, event_id: &str, positive: bool) -> Result<(f64, f64)> {
        let heuristic_id = self
            .heuristic_for_event(event_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("no fired heuristic for event {}", event_id)))?;

        self.ignored.lock().await.remove(&heuristic_id);

        let kind = if positive {
            FeedbackKind::Positive
        } else {
            FeedbackKind::Negative
        };
        self.apply(FeedbackSignal {
            kind,
            heuristic_id,
            magnitude: self.config.explicit_magnitude,
            source: FeedbackSource::Explicit,
        })
        .await
    }

    /// 记录一次 fire：存储留痕 + 进撤销窗口 + 尝试登记待决结果
    pub async fn on_fire(
        &self,
        heuristic_id: &str,
        event_id: &str,
        condition_text: &str,
        predicted_success: f64,
    ) -> Result<String> {
        let fire_id = self.store.record_fire(heuristic_id, event_id).await?;

        let mut fires = self.recent_fires.lock().await;
        fires.push_back(RecentFire {
            heuristic_id: heuristic_id.to_string(),
            event_id: event_id.to_string(),
            fired_at: Instant::now(),
        });
        while fires.len() > self.config.max_tracked_fires {
            fires.pop_front();
        }
        drop(fires);

        self.watcher
            .register_fire(heuristic_id, event_id, condition_text, predicted_success)
            .await;
        Ok(fire_id)
    }

    /// 每个进入系统的事件都先经过这里：结案待决结果 + 撤销检测
    pub async fn check_event(&self, event: &Event) {
        for resolved in self.watcher.resolve_matching(&event.text).await {
            let kind = if resolved.success {
                FeedbackKind::Positive
            } else {
                FeedbackKind::Negative
            };
            tracing::info!(
                heuristic_id = %resolved.heuristic_id,
                expected = %resolved.expected,
                success = resolved.success,
                predicted_success = resolved.predicted_success,
                "pending outcome resolved by event"
            );
            if let Err(e) = self
                .apply(FeedbackSignal {
                    kind,
                    heuristic_id: resolved.heuristic_id.clone(),
                    magnitude: self.config.outcome_magnitude,
                    source: FeedbackSource::ObservedOutcome,
                })
                .await
            {
                tracing::warn!(error = %e, "failed to apply outcome feedback");
            }
        }

        if self.contains_undo_keyword(&event.text) {
            self.punish_recent_fires().await;
        }
    }

    /// 无视计数：到达阈值发一次负信号，之后冻结直到显式反馈解冻
    pub async fn on_heuristic_ignored(&self, heuristic_id: &str) {
        let should_signal = {
            let mut ignored = self.ignored.lock().await;
            let state = ignored.entry(heuristic_id.to_string()).or_default();
            if state.fired {
                false
            } else {
                state.count += 1;
                if state.count >= self.config.ignored_threshold {
                    state.fired = true;
                    true
                } else {
                    false
                }
            }
        };
        if should_signal {
            tracing::info!(
                heuristic_id = %heuristic_id,
                threshold = self.config.ignored_threshold,
                "heuristic repeatedly ignored"
            );
            if let Err(e) = self
                .apply(FeedbackSignal {
                    kind: FeedbackKind::Negative,
                    heuristic_id: heuristic_id.to_string(),
                    magnitude: self.config.ignored_magnitude,
                    source: FeedbackSource::ImplicitIgnored,
                })
                .await
            {
                tracing::warn!(error = %e, "failed to apply ignored feedback");
            }
        }
    }

    /// 推理端背书：输出与候选动作高度相似时的正向强化
    pub async fn on_endorsement(&self, heuristic_id: &str, similarity: f64, magnitude: f64) {
        tracing::debug!(
            heuristic_id = %heuristic_id,
            similarity,
            magnitude,
            "reasoner endorsed heuristic"
        );
        if let Err(e) = self
            .apply(FeedbackSignal {
                kind: FeedbackKind::Positive,
                heuristic_id: heuristic_id.to_string(),
                magnitude,
                source: FeedbackSource::LlmEndorsement,
            })
            .await
        {
            tracing::warn!(error = %e, "failed to apply endorsement feedback");
        }
    }

    /// 清理过期待决结果：时限内无反对即隐式成功，返回处理条数
    pub async fn cleanup_expired(&self) -> usize {
        let expired = self.watcher.take_expired().await;
        let n = expired.len();
        for outcome in expired {
            tracing::debug!(
                heuristic_id = %outcome.heuristic_id,
                "pending outcome expired, treated as implicit success"
            );
            if let Err(e) = self
                .apply(FeedbackSignal {
                    kind: FeedbackKind::Positive,
                    heuristic_id: outcome.heuristic_id.clone(),
                    magnitude: self.config.timeout_magnitude,
                    source: FeedbackSource::ImplicitTimeout,
                })
                .await
            {
                tracing::warn!(error = %e, "failed to apply expiry feedback");
            }
        }
        n
    }

    /// 待决结果数量（观测用）
    pub async fn pending_outcomes(&self) -> usize {
        self.watcher.pending_count().await
    }

    /// 该事件最近一次 fire 的启发式
    pub async fn heuristic_for_event(&self, event_id: &str) -> Option<String> {
        let fires = self.recent_fires.lock().await;
        fires
            .iter()
            .rev()
            .find(|f| f.event_id == event_id)
            .map(|f| f.heuristic_id.clone())
    }

    fn contains_undo_keyword(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config
            .undo_keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }

    /// 撤销：惩罚撤销窗口内的所有 fire，并把它们移出窗口（每次 fire 至多罚一次）
    async fn punish_recent_fires(&self) {
        let window = Duration::from_secs(self.config.undo_window_secs);
        let punished: Vec<RecentFire> = {
            let mut fires = self.recent_fires.lock().await;
            let mut kept = VecDeque::with_capacity(fires.len());
            let mut punished = Vec::new();
            while let Some(fire) = fires.pop_front() {
                if fire.fired_at.elapsed() <= window {
                    punished.push(fire);
                } else {
                    kept.push_back(fire);
                }
            }
            *fires = kept;
            punished
        };

        for fire in punished {
            tracing::info!(
                heuristic_id = %fire.heuristic_id,
                event_id = %fire.event_id,
                "undo keyword observed shortly after fire"
            );
            if let Err(e) = self
                .apply(FeedbackSignal {
                    kind: FeedbackKind::Negative,
                    heuristic_id: fire.heuristic_id.clone(),
                    magnitude: self.config.undo_magnitude,
                    source: FeedbackSource::ImplicitUndo,
                })
                .await
            {
                tracing::warn!(error = %e, "failed to apply undo feedback");
            }
        }
    }

    /// 所有信号的唯一出口：存储原子更新 + 缓存失效
    async fn apply(&self, signal: FeedbackSignal) -> Result<(f64, f64)> {
        let positive = signal.kind == FeedbackKind::Positive;
        let (old, new) = self
            .store
            .update_confidence(&signal.heuristic_id, positive, signal.magnitude, signal.source)
            .await?;
        self.cache.invalidate(&signal.heuristic_id).await;
        tracing::info!(
            heuristic_id = %signal.heuristic_id,
            source = ?signal.source,
            old_confidence = old,
            new_confidence = new,
            "feedback applied"
        );
        Ok((old, new))
    }
}
