//! 启发式缓存：事件文本 → 已学规则的快速匹配
//!
//! 查找顺序：词面包含 → 语义相似（需要嵌入端且未被 skip_semantic
//! 抑制）→ 回源存储并暖化条目。命中统计只认前两步；回源算 miss，
//! 但匹配结果仍从缓存子系统返回（from_cache = true）。
//! 容量满时按 last_hit 最旧的条目淘汰。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::CacheSection;
use crate::llm::embedding::{cosine_similarity, EmbeddingProvider};
use crate::salience::{SalienceResult, SalienceScorer};
use crate::storage::{CandidateHeuristic, Heuristic, HeuristicStore};

/// 缓存条目（置信度是存储值的副本，学习模块更新置信度后会 invalidate）
#[derive(Debug, Clone)]
struct CacheEntry {
    heuristic_id: String,
    condition: String,
    condition_lower: String,
    action: serde_json::Value,
    confidence: f64,
    embedding: Option<Vec<f32>>,
    hit_count: u64,
    last_hit: Instant,
}

/// 一次 evaluate 的结果
#[derive(Debug, Clone)]
pub struct CacheEvaluation {
    /// 匹配到的启发式（无匹配时为 None）
    pub matched: Option<CandidateHeuristic>,
    /// 事件文本的显著度评分
    pub salience: SalienceResult,
    /// 匹配是否出自缓存子系统（条目命中或回源暖化均为 true）
    pub from_cache: bool,
}

/// 缓存统计
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub current_size: usize,
    pub max_capacity: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    /// hits / (hits + misses)，无查找时为 0.0
    pub hit_rate: f64,
}

/// list 返回的条目摘要
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub heuristic_id: String,
    pub condition: String,
    pub confidence: f64,
    pub hit_count: u64,
}

/// 启发式缓存
pub struct HeuristicCache {
    config: CacheSection,
    store: Arc<dyn HeuristicStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    scorer: SalienceScorer,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HeuristicCache {
    pub fn new(
        config: CacheSection,
        store: Arc<dyn HeuristicStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let scorer = SalienceScorer::new(config.habituation_window);
        Self {
            config,
            store,
            embedder,
            scorer,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 评估事件文本：返回匹配（若有）、显著度与 from_cache 标记
    pub async fn evaluate(&self, text: &str, skip_semantic: bool) -> CacheEvaluation {
        // 1) 词面：缓存条目的条件文本被事件文本包含
        if let Some(candidate) = self.lexical_lookup(text).await {
            return self.finish_hit(text, candidate).await;
        }

        // 2) 语义：嵌入事件文本，与缓存嵌入做余弦匹配
        if !skip_semantic {
            if let Some(embedder) = &self.embedder {
                match embedder.embed(text).await {
                    Ok(query) => {
                        if let Some(candidate) = self.semantic_lookup(&query).await {
                            return self.finish_hit(text, candidate).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "embedding failed, lexical only");
                    }
                }
            }
        }

        // 3) 缓存未命中，回源存储
        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.store.query_candidates(text, 0.0, 1).await {
            Ok(candidates) => {
                if let Some(best) = candidates.into_iter().next() {
                    if best.similarity >= self.config.similarity_threshold {
                        self.warm_from_candidate(&best, skip_semantic).await;
                        let salience =
                            self.scorer.score(text, Some(best.confidence), 1);
                        return CacheEvaluation {
                            matched: Some(best),
                            salience,
                            from_cache: true,
                        };
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "storage lookup failed during cache miss");
            }
        }

        CacheEvaluation {
            matched: None,
            salience: self.scorer.score(text, None, 0),
            from_cache: false,
        }
    }

    /// 用一条启发式暖化缓存（预置/种子路径）
    pub async fn warm(&self, heuristic: &Heuristic) {
        let embedding = self.embed_condition(&heuristic.condition).await;
        let entry = CacheEntry {
            heuristic_id: heuristic.id.clone(),
            condition: heuristic.condition.clone(),
            condition_lower: heuristic.condition.to_lowercase(),
            action: heuristic.action.clone(),
            confidence: heuristic.confidence,
            embedding,
            hit_count: 0,
            last_hit: Instant::now(),
        };
        self.insert_entry(entry).await;
    }

    /// 统计快照
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            current_size: self.entries.read().await.len(),
            max_capacity: self.config.max_capacity,
            total_hits: hits,
            total_misses: misses,
            hit_rate,
        }
    }

    /// 按命中数降序列出条目摘要
    pub async fn list(&self, limit: usize) -> Vec<CacheEntryInfo> {
        let entries = self.entries.read().await;
        let mut infos: Vec<CacheEntryInfo> = entries
            .values()
            .map(|e| CacheEntryInfo {
                heuristic_id: e.heuristic_id.clone(),
                condition: e.condition.clone(),
                confidence: e.confidence,
                hit_count: e.hit_count,
            })
            .collect();
        infos.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        infos.truncate(limit);
        infos
    }

    /// 清空全部条目，返回清掉的条数（命中/未命中计数保留）
    pub async fn flush(&self) -> usize {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        entries.clear();
        n
    }

    /// 移除指定条目，返回是否存在
    pub async fn evict(&self, heuristic_id: &str) -> bool {
        self.entries.write().await.remove(heuristic_id).is_some()
    }

    /// 置信度变更后的失效入口（下次查找重新回源）
    pub async fn invalidate(&self, heuristic_id: &str) {
        if self.evict(heuristic_id).await {
            tracing::debug!(heuristic_id = %heuristic_id, "cache entry invalidated");
        }
    }

    async fn lexical_lookup(&self, text: &str) -> Option<CandidateHeuristic> {
        let text_lower = text.to_lowercase();
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| !e.condition_lower.is_empty() && text_lower.contains(&e.condition_lower))
            .max_by_key(|e| e.last_hit)
            .map(|e| CandidateHeuristic {
                id: e.heuristic_id.clone(),
                condition: e.condition.clone(),
                action: e.action.clone(),
                confidence: e.confidence,
                similarity: 1.0,
            })
    }

    async fn semantic_lookup(&self, query: &[f32]) -> Option<CandidateHeuristic> {
        let threshold = self.config.similarity_threshold;
        let entries = self.entries.read().await;
        entries
            .values()
            .filter_map(|e| {
                let embedding = e.embedding.as_ref()?;
                let similarity = cosine_similarity(query, embedding) as f64;
                if similarity >= threshold {
                    Some((e, similarity))
                } else {
                    None
                }
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.total_cmp(sb).then_with(|| a.last_hit.cmp(&b.last_hit))
            })
            .map(|(e, similarity)| CandidateHeuristic {
                id: e.heuristic_id.clone(),
                condition: e.condition.clone(),
                action: e.action.clone(),
                confidence: e.confidence,
                similarity,
            })
    }

    /// 命中收尾：记 hit、更新条目使用信息、打显著度
    async fn finish_hit(&self, text: &str, candidate: CandidateHeuristic) -> CacheEvaluation {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let hit_count = self.touch(&candidate.id).await;
        let salience = self.scorer.score(text, Some(candidate.confidence), hit_count);
        CacheEvaluation {
            matched: Some(candidate),
            salience,
            from_cache: true,
        }
    }

    async fn touch(&self, heuristic_id: &str) -> u64 {
        let mut entries = self.entries.write().await;
        match entries.get_mut(heuristic_id) {
            Some(e) => {
                e.hit_count += 1;
                e.last_hit = Instant::now();
                e.hit_count
            }
            None => 1,
        }
    }

    async fn warm_from_candidate(&self, candidate: &CandidateHeuristic, skip_semantic: bool) {
        let embedding = if skip_semantic {
            None
        } else {
            self.embed_condition(&candidate.condition).await
        };
        let entry = CacheEntry {
            heuristic_id: candidate.id.clone(),
            condition: candidate.condition.clone(),
            condition_lower: candidate.condition.to_lowercase(),
            action: candidate.action.clone(),
            confidence: candidate.confidence,
            embedding,
            hit_count: 1,
            last_hit: Instant::now(),
        };
        self.insert_entry(entry).await;
        tracing::debug!(
            heuristic_id = %candidate.id,
            similarity = candidate.similarity,
            "cache entry warmed from storage"
        );
    }

    async fn embed_condition(&self, condition: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(condition).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(error = %e, "condition embedding failed");
                None
            }
        }
    }

    async fn insert_entry(&self, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        if self.config.max_capacity > 0
            && !entries.contains_key(&entry.heuristic_id)
            && entries.len() >= self.config.max_capacity
        {
            let victim = entries
                .values()
                .min_by_key(|e| e.last_hit)
                .map(|e| e.heuristic_id.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                tracing::debug!(heuristic_id = %victim, "cache entry evicted at capacity");
            }
        }
        entries.insert(entry.heuristic_id.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockEmbedder;
    use crate::storage::MemoryStore;

    fn test_cache(
        max_capacity: usize,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> (HeuristicCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = CacheSection {
            max_capacity,
            ..Default::default()
        };
        let cache = HeuristicCache::new(config, store.clone(), embedder);
        (cache, store)
    }

    #[tokio::test]
    async fn test_lexical_hit_and_hit_rate() {
        let (cache, _) = test_cache(16, None);
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.8);
        cache.warm(&h).await;

        let eval = cache.evaluate("Alert: low health detected", true).await;
        assert!(eval.from_cache);
        assert_eq!(eval.matched.as_ref().map(|m| m.id.as_str()), Some(h.id.as_str()));

        let mut last_rate = cache.stats().await.hit_rate;
        for _ in 0..3 {
            cache.evaluate("Alert: low health detected", true).await;
            let rate = cache.stats().await.hit_rate;
            assert!(rate >= last_rate);
            last_rate = rate;
        }
        assert_eq!(last_rate, 1.0);
    }

    #[tokio::test]
    async fn test_semantic_hit() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::new());
        let (cache, _) = test_cache(16, Some(embedder));
        let h = Heuristic::new("battery level critical", serde_json::json!("plug in charger"))
            .with_confidence(0.7);
        cache.warm(&h).await;

        // 词序不同，词面包含不命中，语义应命中
        let eval = cache.evaluate("critical battery level now", false).await;
        assert!(eval.from_cache);
        assert_eq!(eval.matched.as_ref().map(|m| m.id.as_str()), Some(h.id.as_str()));
        assert!(eval.matched.as_ref().map(|m| m.similarity).unwrap_or(0.0) >= 0.7);
    }

    #[tokio::test]
    async fn test_skip_semantic_suppresses_embedding() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::new());
        let (cache, _) = test_cache(16, Some(embedder));
        let h = Heuristic::new("battery level critical", serde_json::json!("plug in charger"));
        cache.warm(&h).await;

        let eval = cache.evaluate("critical battery level now", true).await;
        assert!(!eval.from_cache);
        assert!(eval.matched.is_none());
        assert_eq!(cache.stats().await.total_misses, 1);
    }

    #[tokio::test]
    async fn test_storage_fallback_warms_entry() {
        let (cache, store) = test_cache(16, None);
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.9);
        let id = h.id.clone();
        store.put_heuristic(h).await.unwrap();

        // 缓存为空：回源匹配，from_cache 仍为 true，但统计记 miss
        let eval = cache.evaluate("low health detected", true).await;
        assert!(eval.from_cache);
        assert_eq!(eval.matched.as_ref().map(|m| m.id.as_str()), Some(id.as_str()));
        let stats = cache.stats().await;
        assert_eq!(stats.total_hits, 0);
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.current_size, 1);

        // 第二次走词面命中
        cache.evaluate("low health detected", true).await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 1);
    }

    #[tokio::test]
    async fn test_miss_without_match() {
        let (cache, _) = test_cache(16, None);
        let eval = cache.evaluate("nothing ever matches this", true).await;
        assert!(!eval.from_cache);
        assert!(eval.matched.is_none());
        // 无匹配时仍给出中性偏低的显著度
        assert!(eval.salience.score >= 0.0 && eval.salience.score <= 1.0);
    }

    #[tokio::test]
    async fn test_flush_and_evict() {
        let (cache, _) = test_cache(16, None);
        let h1 = Heuristic::new("door opened", serde_json::json!("greet"));
        let h2 = Heuristic::new("window opened", serde_json::json!("close it"));
        cache.warm(&h1).await;
        cache.warm(&h2).await;

        assert!(cache.evict(&h1.id).await);
        assert!(!cache.evict(&h1.id).await);
        assert!(!cache.evict("heu_missing").await);

        assert_eq!(cache.flush().await, 1);
        assert_eq!(cache.flush().await, 0);
        assert_eq!(cache.stats().await.current_size, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_hit() {
        let (cache, _) = test_cache(2, None);
        let a = Heuristic::new("alpha condition", serde_json::json!("a"));
        let b = Heuristic::new("beta condition", serde_json::json!("b"));
        let c = Heuristic::new("gamma condition", serde_json::json!("c"));

        cache.warm(&a).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.warm(&b).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // 命中 a，使 b 成为最久未用
        cache.evaluate("alpha condition happened", true).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.warm(&c).await;

        let entries = cache.list(10).await;
        assert_eq!(entries.len(), 2);
        let ids: Vec<&str> = entries.iter().map(|e| e.heuristic_id.as_str()).collect();
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&c.id.as_str()));
        assert!(!ids.contains(&b.id.as_str()));
    }

    #[tokio::test]
    async fn test_list_sorted_by_hits() {
        let (cache, _) = test_cache(16, None);
        let a = Heuristic::new("first rule", serde_json::json!("a"));
        let b = Heuristic::new("second rule", serde_json::json!("b"));
        cache.warm(&a).await;
        cache.warm(&b).await;
        cache.evaluate("second rule fired", true).await;
        cache.evaluate("second rule fired", true).await;

        let entries = cache.list(1).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].heuristic_id, b.id);
        assert_eq!(entries[0].hit_count, 2);
    }
}
