//! 订阅者分发
//!
//! 每个订阅者持有一条无界 mpsc 通道，可按事件来源过滤。广播是
//! 非阻塞的：慢订阅者不拖慢分发，发送失败视为断开并当场剪除。

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use crate::event::AssistantResponse;

/// 订阅者
struct Subscriber {
    /// 只接收该来源的响应；None 表示全量
    source_filter: Option<String>,
    tx: mpsc::UnboundedSender<AssistantResponse>,
}

impl Subscriber {
    fn matches(&self, source: &str) -> bool {
        match &self.source_filter {
            Some(filter) => filter == source,
            None => true,
        }
    }
}

/// 订阅者集合
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// 新建订阅，返回订阅 ID 与接收端
    pub async fn subscribe(
        &self,
        source_filter: Option<String>,
    ) -> (String, mpsc::UnboundedReceiver<AssistantResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = format!("sub_{}", uuid::Uuid::new_v4());
        let subscriber = Subscriber { source_filter, tx };
        self.subscribers.write().await.insert(id.clone(), subscriber);
        tracing::debug!(subscriber_id = %id, "subscriber registered");
        (id, rx)
    }

    /// 取消订阅，返回该 ID 是否存在
    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.write().await.remove(id).is_some()
    }

    /// 广播一条响应，返回实际送达的订阅者数量
    pub async fn broadcast(&self, response: &AssistantResponse) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();
        for (id, sub) in subscribers.iter() {
            if !sub.matches(&response.source) {
                continue;
            }
            if sub.tx.send(response.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id.clone());
            }
        }
        for id in dead {
            subscribers.remove(&id);
            tracing::debug!(subscriber_id = %id, "subscriber disconnected, pruned");
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}
