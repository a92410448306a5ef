//! 内存存储实现
//!
//! 以 tokio RwLock 包住的 HashMap 做启发式/响应表，置信度更新在
//! 一次写锁内完成读-改-写。候选检索用关键词重叠（含整句包含的
//! 快速路径），无真实向量，适合单进程运行与测试。

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::core::{CoreError, Result};
use crate::event::AssistantResponse;

use super::{
    CandidateHeuristic, FeedbackSource, FireRecord, Heuristic, HeuristicStore,
};

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() > 1)
        .collect()
}

/// 词面相似度：条件整句被包含记 1.0，否则为条件词命中比例
fn lexical_similarity(condition: &str, text: &str) -> f64 {
    let cond_lower = condition.to_lowercase();
    let text_lower = text.to_lowercase();
    if !cond_lower.trim().is_empty() && text_lower.contains(cond_lower.trim()) {
        return 1.0;
    }
    let cond_tokens = tokenize_lower(condition);
    if cond_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokenize_lower(text);
    let overlap = cond_tokens.intersection(&text_tokens).count();
    overlap as f64 / cond_tokens.len() as f64
}

/// 内存实现
pub struct MemoryStore {
    heuristics: RwLock<HashMap<String, Heuristic>>,
    fires: RwLock<Vec<FireRecord>>,
    /// event_id -> 该事件的全部终局响应
    responses: RwLock<HashMap<String, Vec<AssistantResponse>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            heuristics: RwLock::new(HashMap::new()),
            fires: RwLock::new(Vec::new()),
            responses: RwLock::new(HashMap::new()),
        }
    }

    /// 当前启发式条数（观测用）
    pub async fn heuristic_count(&self) -> usize {
        self.heuristics.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HeuristicStore for MemoryStore {
    async fn get_heuristic(&self, id: &str) -> Result<Heuristic> {
        self.heuristics
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("heuristic {}", id)))
    }

    async fn put_heuristic(&self, heuristic: Heuristic) -> Result<()> {
        let mut heuristics = self.heuristics.write().await;
        heuristics.insert(heuristic.id.clone(), heuristic);
        Ok(())
    }

    async fn query_candidates(
        &self,
        text: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<CandidateHeuristic>> {
        let heuristics = self.heuristics.read().await;
        let mut scored: Vec<CandidateHeuristic> = heuristics
            .values()
            .filter(|h| h.confidence > min_confidence)
            .filter_map(|h| {
                let similarity = lexical_similarity(&h.condition, text);
                if similarity > 0.0 {
                    Some(CandidateHeuristic {
                        id: h.id.clone(),
                        condition: h.condition.clone(),
                        action: h.action.clone(),
                        confidence: h.confidence,
                        similarity,
                    })
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn update_confidence(
        &self,
        id: &str,
        positive: bool,
        magnitude: f64,
        source: FeedbackSource,
    ) -> Result<(f64, f64)> {
        let mut heuristics = self.heuristics.write().await;
        let heuristic = heuristics
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("heuristic {}", id)))?;
        let old = heuristic.confidence;
        let new = if positive {
            old + magnitude * (1.0 - old)
        } else {
            old - magnitude * old
        }
        .clamp(0.0, 1.0);
        heuristic.confidence = new;
        if positive {
            heuristic.success_count += 1;
        }
        tracing::debug!(
            heuristic_id = %id,
            ?source,
            old_confidence = old,
            new_confidence = new,
            "confidence updated"
        );
        Ok((old, new))
    }

    async fn record_fire(&self, heuristic_id: &str, event_id: &str) -> Result<String> {
        let mut heuristics = self.heuristics.write().await;
        let heuristic = heuristics
            .get_mut(heuristic_id)
            .ok_or_else(|| CoreError::NotFound(format!("heuristic {}", heuristic_id)))?;
        heuristic.fire_count += 1;
        drop(heuristics);

        let record = FireRecord {
            id: format!("fire_{}", uuid::Uuid::new_v4()),
            heuristic_id: heuristic_id.to_string(),
            event_id: event_id.to_string(),
            fired_at: chrono::Utc::now().timestamp_millis(),
        };
        let fire_id = record.id.clone();
        self.fires.write().await.push(record);
        Ok(fire_id)
    }

    async fn record_response(&self, response: &AssistantResponse) -> Result<()> {
        let mut responses = self.responses.write().await;
        responses
            .entry(response.event_id.clone())
            .or_default()
            .push(response.clone());
        Ok(())
    }

    async fn responses_for(&self, event_id: &str) -> Result<Vec<AssistantResponse>> {
        Ok(self
            .responses
            .read()
            .await
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }
}
