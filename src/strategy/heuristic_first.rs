//! heuristic_first 策略
//!
//! 先查候选：任何一条置信度过有效阈值就直接用它的动作，推理端
//! 完全不参与。否则把候选（乱序、不带置信度）连同事件交给推理端；
//! 拿到输出后再做一次受限的自评估调用得出成功预估，并异步比对
//! 推理输出与各候选动作的语义相似度，相似即背书、不似即记无视。

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::StrategySection;
use crate::learning::LearningEngine;
use crate::llm::embedding::{cosine_similarity, EmbeddingProvider};
use crate::llm::{OutputFormat, Reasoner};
use crate::storage::CandidateHeuristic;

use super::{effective_threshold, Decision, DecisionContext, DecisionPath};

/// 启发式优先策略
pub struct HeuristicFirst {
    config: StrategySection,
    system_prompt: String,
    reasoner: Option<Arc<dyn Reasoner>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    learning: Arc<LearningEngine>,
    /// 推理端并发上限（两类调用共用）
    semaphore: Arc<Semaphore>,
    /// 背书强化任务
    reinforcement: Mutex<JoinSet<()>>,
}

impl HeuristicFirst {
    pub fn new(
        config: StrategySection,
        system_prompt: String,
        reasoner: Option<Arc<dyn Reasoner>>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        learning: Arc<LearningEngine>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        Self {
            config,
            system_prompt,
            reasoner,
            embedder,
            learning,
            semaphore,
            reinforcement: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn decide(&self, ctx: &DecisionContext) -> Decision {
        if ctx.event.text.trim().is_empty() {
            tracing::debug!(event_id = %ctx.event.id, "empty event text, decision rejected");
            return Decision::rejected();
        }

        let threshold = effective_threshold(&self.config);

        // 启发式短路：建议项优先，其次次级候选
        if let Some(winner) = ctx
            .suggestion
            .iter()
            .chain(ctx.candidates.iter())
            .find(|c| c.confidence >= threshold)
        {
            tracing::info!(
                event_id = %ctx.event.id,
                heuristic_id = %winner.id,
                confidence = winner.confidence,
                threshold,
                "heuristic short-circuit, reasoner not invoked"
            );
            return Decision {
                path: DecisionPath::Heuristic,
                text: Some(winner.action_text()),
                matched_heuristic_id: Some(winner.id.clone()),
                predicted_success: winner.confidence,
                confidence: winner.confidence,
            };
        }

        let Some(reasoner) = self.reasoner.clone() else {
            tracing::debug!(event_id = %ctx.event.id, "no reasoner configured, decision rejected");
            return Decision::rejected();
        };

        let prompt = self.build_prompt(ctx);
        let output = self
            .bounded_generate(
                &reasoner,
                &prompt,
                Some(&self.system_prompt),
                OutputFormat::Text,
                self.config.request_timeout_ms,
            )
            .await;

        let Some(text) = output else {
            tracing::warn!(event_id = %ctx.event.id, "reasoner produced no output, falling back");
            return Decision {
                path: DecisionPath::Fallback,
                text: Some(self.config.fallback_message.clone()),
                matched_heuristic_id: None,
                predicted_success: 0.0,
                confidence: 0.0,
            };
        };

        let predicted_success = self.self_assess(&reasoner, &ctx.event.text, &text).await;
        self.spawn_reinforcement(ctx, &text).await;

        Decision {
            path: DecisionPath::Llm,
            text: Some(text),
            matched_heuristic_id: None,
            predicted_success,
            confidence: predicted_success,
        }
    }

    /// 中止并等待所有强化任务
    pub async fn shutdown(&self) {
        let mut tasks = self.reinforcement.lock().await;
        tasks.shutdown().await;
    }

    /// 候选乱序列出，只给条件与动作，不泄露置信度
    fn build_prompt(&self, ctx: &DecisionContext) -> String {
        let mut options: Vec<&CandidateHeuristic> = ctx
            .suggestion
            .iter()
            .chain(ctx.candidates.iter())
            .collect();
        options.shuffle(&mut rand::thread_rng());

        let mut prompt = format!(
            "Incoming event from '{}': {}\n",
            ctx.event.source, ctx.event.text
        );
        if !options.is_empty() {
            prompt.push_str("\nPreviously learned reactions that may or may not apply here:\n");
            for (i, c) in options.iter().enumerate() {
                prompt.push_str(&format!(
                    "{}. when \"{}\" then: {}\n",
                    i + 1,
                    c.condition,
                    c.action_text()
                ));
            }
        }
        prompt.push_str(
            "\nDecide the single best short response to this event. Reply with the response text only.",
        );
        prompt
    }

    /// 受限的推理端调用：并发许可 + 超时，空输出折叠为 None
    async fn bounded_generate(
        &self,
        reasoner: &Arc<dyn Reasoner>,
        prompt: &str,
        system_prompt: Option<&str>,
        format: OutputFormat,
        timeout_ms: u64,
    ) -> Option<String> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            reasoner.generate(prompt, system_prompt, format),
        )
        .await;
        drop(permit);

        match result {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reasoner call failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms, "reasoner call timed out");
                None
            }
        }
    }

    /// 第二次受限调用：让推理端给出 0-1 的成功预估，结果封顶
    async fn self_assess(
        &self,
        reasoner: &Arc<dyn Reasoner>,
        event_text: &str,
        response_text: &str,
    ) -> f64 {
        let prompt = format!(
            "You produced the following response to the event \"{}\":\n{}\n\n\
             Estimate the probability, between 0.0 and 1.0, that this response will \
             satisfy the user. Respond as JSON: {{\"success_estimate\": <number>}}",
            event_text, response_text
        );
        let raw = self
            .bounded_generate(
                reasoner,
                &prompt,
                None,
                OutputFormat::Json,
                self.config.assess_timeout_ms,
            )
            .await;

        let estimate = raw
            .as_deref()
            .and_then(parse_success_estimate)
            .unwrap_or(self.config.default_predicted_success);
        estimate
            .clamp(0.0, 1.0)
            .min(self.config.predicted_success_ceiling)
    }

    /// 异步背书：推理输出与候选动作够相似则正向强化，否则记一次无视
    async fn spawn_reinforcement(&self, ctx: &DecisionContext, response_text: &str) {
        let Some(embedder) = self.embedder.clone() else {
            return;
        };
        let options: Vec<CandidateHeuristic> = ctx
            .suggestion
            .iter()
            .chain(ctx.candidates.iter())
            .cloned()
            .collect();
        if options.is_empty() {
            return;
        }

        let learning = self.learning.clone();
        let response_text = response_text.to_string();
        let endorsement_threshold = self.config.endorsement_threshold;
        let endorsement_boost = self.config.endorsement_boost;

        let mut tasks = self.reinforcement.lock().await;
        // 顺手收割已完成的任务，避免集合无限增长
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let response_embedding = match embedder.embed(&response_text).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(error = %e, "response embedding failed, skipping endorsement");
                    return;
                }
            };
            for candidate in options {
                let action = candidate.action_text();
                let action_embedding = match embedder.embed(&action).await {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let similarity =
                    cosine_similarity(&response_embedding, &action_embedding) as f64;
                if similarity >= endorsement_threshold {
                    learning
                        .on_endorsement(&candidate.id, similarity, endorsement_boost * similarity)
                        .await;
                } else {
                    learning.on_heuristic_ignored(&candidate.id).await;
                }
            }
        });
    }
}

fn parse_success_estimate(raw: &str) -> Option<f64> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;
    value.get("success_estimate").and_then(|v| v.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HeuristicCache;
    use crate::config::{CacheSection, LearningSection};
    use crate::event::Event;
    use crate::llm::mock::{MockEmbedder, MockReasoner};
    use crate::salience::SalienceResult;
    use crate::storage::{Heuristic, HeuristicStore, MemoryStore};

    fn candidate(id: &str, condition: &str, action: &str, confidence: f64) -> CandidateHeuristic {
        CandidateHeuristic {
            id: id.to_string(),
            condition: condition.to_string(),
            action: serde_json::json!(action),
            confidence,
            similarity: 1.0,
        }
    }

    fn context(suggestion: Option<CandidateHeuristic>, text: &str) -> DecisionContext {
        DecisionContext {
            event: Event::new("test", text),
            suggestion,
            candidates: Vec::new(),
            salience: SalienceResult::neutral(0.5),
        }
    }

    async fn strategy_with(
        config: StrategySection,
        reasoner: Option<Arc<dyn Reasoner>>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> (HeuristicFirst, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(HeuristicCache::new(
            CacheSection::default(),
            store.clone(),
            None,
        ));
        let learning = Arc::new(LearningEngine::new(
            LearningSection::default(),
            store.clone(),
            cache,
        ));
        let s = HeuristicFirst::new(
            config,
            "You are a test assistant.".to_string(),
            reasoner,
            embedder,
            learning,
        );
        (s, store)
    }

    #[tokio::test]
    async fn test_confident_heuristic_short_circuits() {
        let reasoner = Arc::new(MockReasoner::echo());
        let (strategy, _) =
            strategy_with(StrategySection::default(), Some(reasoner.clone()), None).await;

        let ctx = context(
            Some(candidate("heu_1", "low health detected", "drink potion", 0.9)),
            "Alert: low health detected",
        );
        let decision = strategy.decide(&ctx).await;

        assert_eq!(decision.path, DecisionPath::Heuristic);
        assert_eq!(decision.text.as_deref(), Some("drink potion"));
        assert_eq!(decision.matched_heuristic_id.as_deref(), Some("heu_1"));
        assert_eq!(decision.predicted_success, 0.9);
        // 推理端一次都没被调用
        assert_eq!(reasoner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_path_with_self_assessment() {
        let reasoner = Arc::new(
            MockReasoner::new()
                .with_reply("open the calendar")
                .with_reply(r#"{"success_estimate": 0.95}"#),
        );
        let (strategy, _) =
            strategy_with(StrategySection::default(), Some(reasoner.clone()), None).await;

        let ctx = context(
            Some(candidate("heu_1", "meeting reminder", "snooze it", 0.4)),
            "Reminder: standup in 5 minutes",
        );
        let decision = strategy.decide(&ctx).await;

        assert_eq!(decision.path, DecisionPath::Llm);
        assert_eq!(decision.text.as_deref(), Some("open the calendar"));
        assert!(decision.matched_heuristic_id.is_none());
        // 0.95 被封顶在 0.8
        assert_eq!(decision.predicted_success, 0.8);
        assert_eq!(reasoner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_assessment_uses_default() {
        let reasoner = Arc::new(MockReasoner::echo());
        let (strategy, _) = strategy_with(StrategySection::default(), Some(reasoner), None).await;

        let decision = strategy.decide(&context(None, "hello there")).await;
        assert_eq!(decision.path, DecisionPath::Llm);
        assert_eq!(decision.predicted_success, 0.5);
    }

    #[tokio::test]
    async fn test_silent_reasoner_falls_back() {
        let reasoner = Arc::new(MockReasoner::new());
        let (strategy, _) =
            strategy_with(StrategySection::default(), Some(reasoner.clone()), None).await;

        let decision = strategy.decide(&context(None, "unmatched event")).await;
        assert_eq!(decision.path, DecisionPath::Fallback);
        assert_eq!(
            decision.text.as_deref(),
            Some("No automated response is available for this event.")
        );
        // 没有输出就不再做自评估
        assert_eq!(reasoner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_without_reasoner() {
        let (strategy, _) = strategy_with(StrategySection::default(), None, None).await;
        let ctx = context(
            Some(candidate("heu_1", "door opened", "greet", 0.4)),
            "door opened",
        );
        let decision = strategy.decide(&ctx).await;
        assert_eq!(decision.path, DecisionPath::Rejected);
        assert!(decision.text.is_none());
    }

    #[tokio::test]
    async fn test_rejected_on_empty_text() {
        let reasoner = Arc::new(MockReasoner::echo());
        let (strategy, _) =
            strategy_with(StrategySection::default(), Some(reasoner.clone()), None).await;

        let decision = strategy.decide(&context(None, "   ")).await;
        assert_eq!(decision.path, DecisionPath::Rejected);
        assert_eq!(reasoner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_endorsement_reinforces_candidate() {
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion now"))
            .with_confidence(0.5);
        let id = h.id.clone();
        let reasoner = Arc::new(
            MockReasoner::new()
                .with_reply("drink potion now")
                .with_reply(r#"{"success_estimate": 0.6}"#),
        );
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::new());
        let (strategy, store) = strategy_with(
            StrategySection::default(),
            Some(reasoner),
            Some(embedder),
        )
        .await;
        store.put_heuristic(h).await.unwrap();

        let ctx = context(
            Some(candidate(&id, "low health detected", "drink potion now", 0.5)),
            "Alert: low health detected",
        );
        let decision = strategy.decide(&ctx).await;
        assert_eq!(decision.path, DecisionPath::Llm);

        // 强化是异步的，等它落地
        tokio::time::sleep(Duration::from_millis(100)).await;
        let updated = store.get_heuristic(&id).await.unwrap();
        assert!(updated.confidence > 0.5);
    }

    #[tokio::test]
    async fn test_unrelated_output_counts_as_ignored() {
        let h = Heuristic::new("low health detected", serde_json::json!("drink potion"))
            .with_confidence(0.5);
        let id = h.id.clone();
        let reasoner = Arc::new(
            MockReasoner::new()
                .with_reply("completely unrelated words")
                .with_reply(r#"{"success_estimate": 0.6}"#),
        );
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::new());

        let store = Arc::new(MemoryStore::new());
        store.put_heuristic(h).await.unwrap();
        let cache = Arc::new(HeuristicCache::new(
            CacheSection::default(),
            store.clone(),
            None,
        ));
        let learning = Arc::new(LearningEngine::new(
            LearningSection {
                ignored_threshold: 1,
                ..Default::default()
            },
            store.clone(),
            cache,
        ));
        let strategy = HeuristicFirst::new(
            StrategySection::default(),
            "You are a test assistant.".to_string(),
            Some(reasoner),
            Some(embedder),
            learning,
        );

        let ctx = context(
            Some(candidate(&id, "low health detected", "drink potion", 0.5)),
            "Alert: low health detected",
        );
        strategy.decide(&ctx).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // 阈值为 1：一次无视即降置信度
        let updated = store.get_heuristic(&id).await.unwrap();
        assert!(updated.confidence < 0.5);
    }

    #[test]
    fn test_parse_success_estimate() {
        assert_eq!(
            parse_success_estimate(r#"{"success_estimate": 0.7}"#),
            Some(0.7)
        );
        assert_eq!(
            parse_success_estimate(r#"Sure: {"success_estimate": 0.25} hope that helps"#),
            Some(0.25)
        );
        assert_eq!(parse_success_estimate("no json here"), None);
        assert_eq!(parse_success_estimate(r#"{"other": 1}"#), None);
    }
}
