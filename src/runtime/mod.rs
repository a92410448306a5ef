//! 运行时装配与服务面
//!
//! 把缓存、路由、队列、策略、学习装配成一个对外表面：
//! publish / subscribe / provide_feedback / flush_pending / 缓存管理。
//! 组件全部吃配置快照，构造后不可变。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntryInfo, CacheStats, HeuristicCache};
use crate::config::AppConfig;
use crate::core::Result;
use crate::event::{AssistantResponse, Event};
use crate::learning::LearningEngine;
use crate::llm::embedding::EmbeddingProvider;
use crate::llm::Reasoner;
use crate::queue::{EventQueue, QueueStats, SubscriberHub};
use crate::router::{EventRouter, RouteDecision};
use crate::storage::{Heuristic, HeuristicStore};
use crate::strategy::{create_strategy, effective_threshold, DecisionStrategy};

/// 事件的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 紧急快路，已立即响应
    Immediate,
    /// 已入队，等待决策
    Queued,
}

/// publish 的回执
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub accepted: bool,
    pub disposition: Disposition,
    /// 快路立即产生的响应
    pub response: Option<AssistantResponse>,
    pub matched_heuristic_id: Option<String>,
}

/// 决策核心运行时
pub struct ReflexRuntime {
    config: AppConfig,
    store: Arc<dyn HeuristicStore>,
    cache: Arc<HeuristicCache>,
    learning: Arc<LearningEngine>,
    strategy: Arc<DecisionStrategy>,
    router: EventRouter,
    queue: Arc<EventQueue>,
    hub: Arc<SubscriberHub>,
    sweep_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReflexRuntime {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn HeuristicStore>,
        reasoner: Option<Arc<dyn Reasoner>>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let cache = Arc::new(HeuristicCache::new(
            config.cache.clone(),
            store.clone(),
            embedder.clone(),
        ));
        let learning = Arc::new(LearningEngine::new(
            config.learning.clone(),
            store.clone(),
            cache.clone(),
        ));
        let strategy = Arc::new(create_strategy(
            &config.strategy,
            &config.reasoner.system_prompt,
            reasoner,
            embedder,
            learning.clone(),
        ));
        let router = EventRouter::new(
            config.router.clone(),
            effective_threshold(&config.strategy),
            Some(cache.clone()),
            store.clone(),
        );
        let hub = Arc::new(SubscriberHub::new());
        let queue = Arc::new(EventQueue::new(
            config.queue.clone(),
            store.clone(),
            strategy.clone(),
            hub.clone(),
            learning.clone(),
        ));
        Self {
            config,
            store,
            cache,
            learning,
            strategy,
            router,
            queue,
            hub,
            sweep_cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// 启动队列与周期清理任务
    pub async fn start(&self) {
        self.queue.start().await;

        let learning = self.learning.clone();
        let cancel = self.sweep_cancel.clone();
        let interval_secs = self.config.learning.sweep_interval_secs.max(1);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let n = learning.cleanup_expired().await;
                        if n > 0 {
                            tracing::info!(count = n, "expired pending outcomes treated as implicit success");
                        }
                    }
                }
            }
        });
        *self.sweeper.lock().await = Some(handle);
        tracing::info!("reflex runtime started");
    }

    /// 有序停机：停清理任务、停队列、收掉策略的强化任务
    pub async fn shutdown(&self) {
        self.sweep_cancel.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        self.queue.stop().await;
        self.strategy.shutdown().await;
        tracing::info!("reflex runtime stopped");
    }

    /// 发布一个事件：先过学习模块，再路由
    pub async fn publish(&self, event: Event) -> Result<PublishReceipt> {
        tracing::debug!(event_id = %event.id, source = %event.source, "event published");
        self.learning.check_event(&event).await;

        match self.router.route(&event).await {
            RouteDecision::Immediate { response, matched } => {
                if let Err(e) = self.store.record_response(&response).await {
                    tracing::warn!(
                        error = %e,
                        response_id = %response.id,
                        "failed to store emergency response, broadcasting anyway"
                    );
                }
                if let Err(e) = self
                    .learning
                    .on_fire(
                        &matched.id,
                        &event.id,
                        &matched.condition,
                        response.predicted_success,
                    )
                    .await
                {
                    tracing::warn!(error = %e, heuristic_id = %matched.id, "failed to record fire");
                }
                let delivered = self.hub.broadcast(&response).await;
                tracing::info!(
                    event_id = %event.id,
                    heuristic_id = %matched.id,
                    delivered,
                    "emergency response delivered"
                );
                Ok(PublishReceipt {
                    accepted: true,
                    disposition: Disposition::Immediate,
                    matched_heuristic_id: Some(matched.id),
                    response: Some(response),
                })
            }
            RouteDecision::Enqueue {
                priority,
                salience,
                suggestion,
                candidates,
                from_cache,
            } => {
                let matched_heuristic_id = suggestion.as_ref().map(|s| s.id.clone());
                self.queue
                    .enqueue(event, priority, salience, suggestion, candidates, from_cache)
                    .await?;
                Ok(PublishReceipt {
                    accepted: true,
                    disposition: Disposition::Queued,
                    response: None,
                    matched_heuristic_id,
                })
            }
        }
    }

    /// 逐个发布一串事件；队列关闭等错误会中断剩余部分
    pub async fn publish_stream<S>(&self, events: S) -> Result<Vec<PublishReceipt>>
    where
        S: Stream<Item = Event> + Send,
    {
        pin_mut!(events);
        let mut receipts = Vec::new();
        while let Some(event) = events.next().await {
            receipts.push(self.publish(event).await?);
        }
        Ok(receipts)
    }

    /// 订阅终局响应，可按事件来源过滤
    pub async fn subscribe(
        &self,
        source_filter: Option<String>,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<AssistantResponse>) {
        self.hub.subscribe(source_filter).await
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.hub.unsubscribe(subscriber_id).await
    }

    /// 对某事件的响应给出显式反馈，返回 (旧置信度, 新置信度)
    pub async fn provide_feedback(&self, event_id: &str, positive: bool) -> Result<(f64, f64)> {
        self.learning.on_feedback(event_id, positive).await
    }

    /// 清空队列，每个在队事件广播一条 Flushed 响应
    pub async fn flush_pending(&self, reason: &str) -> usize {
        self.queue.flush_pending(reason).await
    }

    /// 预置一条启发式并暖化缓存
    pub async fn seed_heuristic(&self, heuristic: Heuristic) -> Result<()> {
        self.store.put_heuristic(heuristic.clone()).await?;
        self.cache.warm(&heuristic).await;
        tracing::info!(
            heuristic_id = %heuristic.id,
            condition = %heuristic.condition,
            confidence = heuristic.confidence,
            "heuristic seeded"
        );
        Ok(())
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn cache_list(&self, limit: usize) -> Vec<CacheEntryInfo> {
        self.cache.list(limit).await
    }

    pub async fn cache_flush(&self) -> usize {
        self.cache.flush().await
    }

    pub async fn cache_evict(&self, heuristic_id: &str) -> bool {
        self.cache.evict(heuristic_id).await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreError;
    use crate::event::ResponseKind;
    use crate::salience::SalienceResult;
    use crate::storage::MemoryStore;

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.queue.workers = 1;
        config.queue.scan_interval_ms = 50;
        config
    }

    fn runtime_with(config: AppConfig) -> Arc<ReflexRuntime> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(ReflexRuntime::new(config, store, None, None))
    }

    #[tokio::test]
    async fn test_emergency_publish_is_immediate() {
        let runtime = runtime_with(quiet_config());
        runtime.start().await;

        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.9);
        runtime.seed_heuristic(h.clone()).await.unwrap();

        let mut salience = SalienceResult::neutral(0.5);
        salience.threat = 0.95;
        salience.score = 0.9;
        let event = Event::new("game", "Alert: low health detected")
            .with_salience(salience)
            .with_skip_semantic(true);

        let receipt = runtime.publish(event).await.unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.disposition, Disposition::Immediate);
        assert_eq!(receipt.matched_heuristic_id.as_deref(), Some(h.id.as_str()));
        let response = receipt.response.unwrap();
        assert_eq!(response.kind, ResponseKind::Emergency);
        assert_eq!(response.text, "drink potion");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_publish_is_queued() {
        let runtime = runtime_with(quiet_config());
        runtime.start().await;

        let receipt = runtime
            .publish(Event::new("chat", "hello there"))
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.disposition, Disposition::Queued);
        assert!(receipt.response.is_none());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_event_is_not_found() {
        let runtime = runtime_with(quiet_config());
        let result = runtime.provide_feedback("evt_missing", true).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_seed_warms_cache() {
        let runtime = runtime_with(quiet_config());
        let h = Heuristic::new("door opened", serde_json::json!("greet")).with_confidence(0.6);
        runtime.seed_heuristic(h.clone()).await.unwrap();

        let entries = runtime.cache_list(10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].heuristic_id, h.id);
        assert!(runtime.cache_evict(&h.id).await);
        assert_eq!(runtime.cache_stats().await.current_size, 0);
    }

    #[tokio::test]
    async fn test_publish_stream() {
        let runtime = runtime_with(quiet_config());
        runtime.start().await;

        let events = futures_util::stream::iter(vec![
            Event::new("chat", "first"),
            Event::new("chat", "second"),
        ]);
        let receipts = runtime.publish_stream(events).await.unwrap();
        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().all(|r| r.disposition == Disposition::Queued));

        runtime.shutdown().await;
    }
}
