//! 事件队列：带 SLA 时限的优先级队列 + 工作者池
//!
//! 入队即定死线（now + sla_ms）。工作者取最高优先级的未过期事件
//! 交给决策策略；后台扫描器按固定间隔把过期事件合成超时响应。
//! 每个入队事件恰好结案一次：决策、超时或冲洗，三者取一。
//! 终局响应先落存储再广播，存储失败只记日志、不挡广播。
//! 队列只在内存里，进程退出即丢，持久化交给存储层的响应留痕。

pub mod subscriber;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::QueueSection;
use crate::core::{CoreError, Result};
use crate::event::{AssistantResponse, Event, ResponseKind};
use crate::learning::LearningEngine;
use crate::salience::SalienceResult;
use crate::storage::{CandidateHeuristic, HeuristicStore};
use crate::strategy::{DecisionContext, DecisionPath, DecisionStrategy};

pub use subscriber::SubscriberHub;

/// 队列中的事件
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub event: Event,
    pub priority: f64,
    pub salience: SalienceResult,
    pub suggestion: Option<CandidateHeuristic>,
    pub candidates: Vec<CandidateHeuristic>,
    pub from_cache: bool,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    /// 同优先级内先进先出
    seq: u64,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 队列统计
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_timed_out: u64,
    pub current_depth: usize,
}

/// 事件队列
pub struct EventQueue {
    config: QueueSection,
    heap: Mutex<BinaryHeap<QueuedItem>>,
    notify: Notify,
    seq: AtomicU64,
    store: Arc<dyn HeuristicStore>,
    strategy: Arc<DecisionStrategy>,
    hub: Arc<SubscriberHub>,
    learning: Arc<LearningEngine>,
    cancel: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    enqueued: AtomicU64,
    processed: AtomicU64,
    timed_out: AtomicU64,
}

impl EventQueue {
    pub fn new(
        config: QueueSection,
        store: Arc<dyn HeuristicStore>,
        strategy: Arc<DecisionStrategy>,
        hub: Arc<SubscriberHub>,
        learning: Arc<LearningEngine>,
    ) -> Self {
        Self {
            config,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            store,
            strategy,
            hub,
            learning,
            cancel: CancellationToken::new(),
            workers: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// 启动工作者与超时扫描器
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.workers {
            let queue = Arc::clone(self);
            workers.spawn(async move {
                queue.worker_loop(worker_id).await;
            });
        }
        let queue = Arc::clone(self);
        workers.spawn(async move {
            queue.scan_loop().await;
        });
        tracing::info!(
            workers = self.config.workers,
            sla_ms = self.config.sla_ms,
            "event queue started"
        );
    }

    /// 停止：不再接收新事件，等待在途处理结束（剩余事件留在队列里）
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        tracing::info!("event queue stopped");
    }

    /// 事件入队，死线 = now + sla_ms
    pub async fn enqueue(
        &self,
        event: Event,
        priority: f64,
        salience: SalienceResult,
        suggestion: Option<CandidateHeuristic>,
        candidates: Vec<CandidateHeuristic>,
        from_cache: bool,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::QueueClosed);
        }
        let now = Instant::now();
        let item = QueuedItem {
            event,
            priority,
            salience,
            suggestion,
            candidates,
            from_cache,
            enqueued_at: now,
            deadline: now + Duration::from_millis(self.config.sla_ms),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let depth = {
            let mut heap = self.heap.lock().await;
            heap.push(item);
            heap.len()
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        tracing::debug!(priority, depth, "event enqueued");
        Ok(())
    }

    /// 冲洗：清空队列，每个事件广播一条 Flushed 哨兵响应，返回条数
    pub async fn flush_pending(&self, reason: &str) -> usize {
        let drained: Vec<QueuedItem> = {
            let mut heap = self.heap.lock().await;
            heap.drain().collect()
        };
        let n = drained.len();
        for item in drained {
            let response = AssistantResponse::new(
                &item.event,
                format!("Pending decision flushed: {}", reason),
                ResponseKind::Flushed,
            );
            self.deliver(response).await;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        if n > 0 {
            tracing::info!(count = n, reason, "pending events flushed");
        }
        n
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            total_enqueued: self.enqueued.load(Ordering::Relaxed),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_timed_out: self.timed_out.load(Ordering::Relaxed),
            current_depth: self.heap.lock().await.len(),
        }
    }

    /// 超时/冲洗响应的出口：先落存储再广播，存储失败不拦广播
    async fn deliver(&self, response: AssistantResponse) {
        if let Err(e) = self.store.record_response(&response).await {
            tracing::warn!(
                error = %e,
                response_id = %response.id,
                "failed to store response, broadcasting anyway"
            );
        }
        let delivered = self.hub.broadcast(&response).await;
        tracing::debug!(
            response_id = %response.id,
            event_id = %response.event_id,
            kind = ?response.kind,
            delivered,
            "response delivered"
        );
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "queue worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let item = {
                let mut heap = self.heap.lock().await;
                heap.pop()
            };
            match item {
                Some(item) => {
                    // 接力：还有剩余就唤醒一个同伴
                    if !self.heap.lock().await.is_empty() {
                        self.notify.notify_one();
                    }
                    self.handle_item(item).await;
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id, "queue worker stopped");
    }

    async fn scan_loop(self: Arc<Self>) {
        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.scan_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {
                    for item in self.take_expired().await {
                        self.finish_timeout(item).await;
                    }
                }
            }
        }
    }

    async fn take_expired(&self) -> Vec<QueuedItem> {
        let now = Instant::now();
        let mut heap = self.heap.lock().await;
        let (expired, live): (Vec<QueuedItem>, Vec<QueuedItem>) =
            heap.drain().partition(|i| i.deadline <= now);
        *heap = live.into_iter().collect();
        expired
    }

    async fn handle_item(&self, item: QueuedItem) {
        // 弹出时已过死线：走同一条超时收尾
        if item.deadline <= Instant::now() {
            self.finish_timeout(item).await;
            return;
        }

        let ctx = DecisionContext {
            event: item.event.clone(),
            suggestion: item.suggestion.clone(),
            candidates: item.candidates.clone(),
            salience: item.salience.clone(),
        };
        let decision = self.strategy.decide(&ctx).await;

        let response = match decision.path {
            DecisionPath::Rejected => {
                // 策略拒绝：合成「推理端不可用」哨兵
                AssistantResponse::new(
                    &item.event,
                    "reasoning engine unavailable",
                    ResponseKind::NoReasoner,
                )
            }
            path => {
                let kind = match path {
                    DecisionPath::Heuristic => ResponseKind::Heuristic,
                    DecisionPath::Llm => ResponseKind::Llm,
                    _ => ResponseKind::Fallback,
                };
                let text = decision.text.clone().unwrap_or_default();
                let mut response = AssistantResponse::new(&item.event, text, kind)
                    .with_predicted_success(decision.predicted_success);
                if let Some(id) = &decision.matched_heuristic_id {
                    response = response.with_heuristic(id, decision.confidence);
                    // 缓存标记只对缓存给出的那条建议成立
                    let via_cache = item.from_cache
                        && item.suggestion.as_ref().map(|s| &s.id) == Some(id);
                    response = response.with_from_cache(via_cache);
                }
                response
            }
        };

        if let Err(e) = self.store.record_response(&response).await {
            tracing::warn!(
                error = %e,
                response_id = %response.id,
                "failed to store response, broadcasting anyway"
            );
        }

        // fire 在广播前落账：订阅者一收到响应就能对它做显式反馈
        if let Some(heuristic_id) = &decision.matched_heuristic_id {
            let condition = item
                .suggestion
                .iter()
                .chain(item.candidates.iter())
                .find(|c| &c.id == heuristic_id)
                .map(|c| c.condition.clone())
                .unwrap_or_default();
            if let Err(e) = self
                .learning
                .on_fire(
                    heuristic_id,
                    &item.event.id,
                    &condition,
                    decision.predicted_success,
                )
                .await
            {
                tracing::warn!(error = %e, heuristic_id = %heuristic_id, "failed to record fire");
            }
        }

        let delivered = self.hub.broadcast(&response).await;
        tracing::debug!(
            response_id = %response.id,
            event_id = %response.event_id,
            kind = ?response.kind,
            delivered,
            "response delivered"
        );
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn finish_timeout(&self, item: QueuedItem) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        let waited = item.enqueued_at.elapsed().as_millis();
        tracing::warn!(
            event_id = %item.event.id,
            priority = item.priority,
            waited_ms = waited as u64,
            "event timed out before a decision was reached"
        );
        let response = AssistantResponse::new(
            &item.event,
            format!("No decision was reached within the {} ms SLA.", self.config.sla_ms),
            ResponseKind::Timeout,
        );
        self.deliver(response).await;
    }
}
