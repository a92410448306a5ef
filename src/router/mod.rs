//! 事件路由：显著度评定 + 紧急快路 + 候选收集
//!
//! 每个事件先定显著度（外部提供的优先，其次缓存评估，最后中性
//! 兜底），再判紧急快路：匹配置信度与威胁维度必须同时过线才跳过
//! 队列。其余事件按 max(score, threat) 入队，并附带一份用于推理
//! 的次级候选列表。

use std::sync::Arc;

use crate::cache::HeuristicCache;
use crate::config::RouterSection;
use crate::event::{AssistantResponse, Event, ResponseKind};
use crate::salience::SalienceResult;
use crate::storage::{CandidateHeuristic, HeuristicStore};

/// 路由结论
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// 紧急快路：立即响应，不入队
    Immediate {
        response: AssistantResponse,
        matched: CandidateHeuristic,
    },
    /// 常规路径：入队等待决策
    Enqueue {
        priority: f64,
        salience: SalienceResult,
        /// 缓存/存储给出的最佳匹配
        suggestion: Option<CandidateHeuristic>,
        /// 供推理端参考的次级候选（不含最佳匹配）
        candidates: Vec<CandidateHeuristic>,
        from_cache: bool,
    },
}

/// 事件路由器
pub struct EventRouter {
    config: RouterSection,
    /// 决策策略的有效接受阈值，用于次级候选的排除规则
    acceptance_threshold: f64,
    cache: Option<Arc<HeuristicCache>>,
    store: Arc<dyn HeuristicStore>,
}

impl EventRouter {
    pub fn new(
        config: RouterSection,
        acceptance_threshold: f64,
        cache: Option<Arc<HeuristicCache>>,
        store: Arc<dyn HeuristicStore>,
    ) -> Self {
        Self {
            config,
            acceptance_threshold,
            cache,
            store,
        }
    }

    /// 路由一个事件
    pub async fn route(&self, event: &Event) -> RouteDecision {
        // 匹配始终由缓存评估给出；显著度则是外部提供的优先
        let (matched, cache_salience, from_cache) = match &self.cache {
            Some(cache) => {
                let eval = cache.evaluate(&event.text, event.skip_semantic).await;
                (eval.matched, Some(eval.salience), eval.from_cache)
            }
            None => (None, None, false),
        };

        let salience = match &event.salience {
            Some(s) => s.clone(),
            None => cache_salience
                .unwrap_or_else(|| SalienceResult::neutral(self.config.neutral_salience)),
        };

        // 紧急快路：置信度与威胁必须同时过线
        if let Some(m) = &matched {
            if m.confidence >= self.config.emergency_confidence_threshold
                && salience.threat >= self.config.emergency_threat_threshold
            {
                tracing::info!(
                    event_id = %event.id,
                    heuristic_id = %m.id,
                    confidence = m.confidence,
                    threat = salience.threat,
                    "emergency fast path triggered"
                );
                let response = AssistantResponse::new(event, m.action_text(), ResponseKind::Emergency)
                    .with_heuristic(&m.id, m.confidence)
                    .with_predicted_success(m.confidence)
                    .with_from_cache(from_cache);
                return RouteDecision::Immediate {
                    response,
                    matched: m.clone(),
                };
            }
        }

        let candidates = self.secondary_candidates(event, matched.as_ref()).await;
        let priority = salience.priority();
        tracing::debug!(
            event_id = %event.id,
            priority,
            suggestion = matched.as_ref().map(|m| m.id.as_str()).unwrap_or("-"),
            secondary = candidates.len(),
            "event routed to queue"
        );
        RouteDecision::Enqueue {
            priority,
            salience,
            suggestion: matched,
            candidates,
            from_cache,
        }
    }

    /// 次级候选：排除最佳匹配与已过接受阈值的候选，按相似度降序截断
    async fn secondary_candidates(
        &self,
        event: &Event,
        best: Option<&CandidateHeuristic>,
    ) -> Vec<CandidateHeuristic> {
        if self.config.max_evaluation_candidates <= 1 {
            return Vec::new();
        }
        let fetch = self.config.max_evaluation_candidates + 8;
        let mut candidates = match self.store.query_candidates(&event.text, 0.0, fetch).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, event_id = %event.id, "candidate query failed");
                return Vec::new();
            }
        };
        candidates.retain(|c| {
            best.map(|b| b.id != c.id).unwrap_or(true)
                && c.confidence < self.acceptance_threshold
        });
        candidates.truncate(self.config.max_evaluation_candidates - 1);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSection;
    use crate::storage::{Heuristic, MemoryStore};

    async fn router_with_store(
        config: RouterSection,
        heuristics: Vec<Heuristic>,
    ) -> (EventRouter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for h in heuristics {
            store.put_heuristic(h).await.unwrap();
        }
        let cache = Arc::new(HeuristicCache::new(
            CacheSection::default(),
            store.clone(),
            None,
        ));
        let router = EventRouter::new(config, 0.7, Some(cache), store.clone());
        (router, store)
    }

    fn high_threat() -> SalienceResult {
        let mut s = SalienceResult::neutral(0.5);
        s.threat = 0.95;
        s.score = 0.9;
        s
    }

    #[tokio::test]
    async fn test_emergency_requires_both_thresholds() {
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.9);
        let (router, _) = router_with_store(RouterSection::default(), vec![h.clone()]).await;

        // 置信度与威胁都过线：走快路
        let event = Event::new("game", "Alert: low health detected")
            .with_salience(high_threat())
            .with_skip_semantic(true);
        match router.route(&event).await {
            RouteDecision::Immediate { response, matched } => {
                assert_eq!(response.kind, ResponseKind::Emergency);
                assert_eq!(response.text, "drink potion");
                assert_eq!(matched.id, h.id);
            }
            RouteDecision::Enqueue { .. } => panic!("expected immediate decision"),
        }

        // 威胁不足：入队
        let calm = Event::new("game", "Alert: low health detected").with_skip_semantic(true);
        assert!(matches!(
            router.route(&calm).await,
            RouteDecision::Enqueue { .. }
        ));
    }

    #[tokio::test]
    async fn test_emergency_requires_confidence() {
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.5);
        let (router, _) = router_with_store(RouterSection::default(), vec![h]).await;

        // 威胁很高但置信度不足：不走快路
        let event = Event::new("game", "Alert: low health detected")
            .with_salience(high_threat())
            .with_skip_semantic(true);
        assert!(matches!(
            router.route(&event).await,
            RouteDecision::Enqueue { .. }
        ));
    }

    #[tokio::test]
    async fn test_supplied_salience_wins() {
        let store = Arc::new(MemoryStore::new());
        let router = EventRouter::new(RouterSection::default(), 0.7, None, store);

        let mut s = SalienceResult::neutral(0.2);
        s.score = 0.9;
        let event = Event::new("chat", "hello there").with_salience(s);
        match router.route(&event).await {
            RouteDecision::Enqueue { priority, .. } => assert_eq!(priority, 0.9),
            RouteDecision::Immediate { .. } => panic!("expected enqueue"),
        }
    }

    #[tokio::test]
    async fn test_neutral_salience_without_cache() {
        let store = Arc::new(MemoryStore::new());
        let router = EventRouter::new(RouterSection::default(), 0.7, None, store);

        let event = Event::new("chat", "hello there");
        match router.route(&event).await {
            RouteDecision::Enqueue {
                priority, salience, ..
            } => {
                assert_eq!(priority, 0.5);
                assert_eq!(salience.score, 0.5);
                assert_eq!(salience.threat, 0.5);
            }
            RouteDecision::Immediate { .. } => panic!("expected enqueue"),
        }
    }

    #[tokio::test]
    async fn test_secondary_candidates_exclusions() {
        let best = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.65);
        let strong = Heuristic::new("health warning", serde_json::json!("check vitals"))
            .with_confidence(0.9);
        let weak = Heuristic::new("low health alarm", serde_json::json!("pause game"))
            .with_confidence(0.4);
        let (router, _) = router_with_store(
            RouterSection::default(),
            vec![best.clone(), strong.clone(), weak.clone()],
        )
        .await;

        let event = Event::new("game", "Alert: low health detected").with_skip_semantic(true);
        match router.route(&event).await {
            RouteDecision::Enqueue {
                suggestion,
                candidates,
                ..
            } => {
                // 最佳匹配是整句被包含的那条
                assert_eq!(suggestion.as_ref().map(|s| s.id.as_str()), Some(best.id.as_str()));
                // 次级候选排除最佳匹配与置信度过线（0.9 >= 0.7）的那条
                let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
                assert_eq!(ids, vec![weak.id.as_str()]);
            }
            RouteDecision::Immediate { .. } => panic!("expected enqueue"),
        }
    }

    #[tokio::test]
    async fn test_secondary_candidates_capped() {
        let config = RouterSection {
            max_evaluation_candidates: 2,
            ..Default::default()
        };
        let best = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.65);
        let a = Heuristic::new("low health alarm", serde_json::json!("a")).with_confidence(0.3);
        let b = Heuristic::new("health check", serde_json::json!("b")).with_confidence(0.3);
        let (router, _) = router_with_store(config, vec![best, a.clone(), b]).await;

        let event = Event::new("game", "Alert: low health detected").with_skip_semantic(true);
        match router.route(&event).await {
            RouteDecision::Enqueue { candidates, .. } => {
                assert_eq!(candidates.len(), 1);
                // 留下的是相似度更高的那条
                assert_eq!(candidates[0].id, a.id);
            }
            RouteDecision::Immediate { .. } => panic!("expected enqueue"),
        }
    }
}
