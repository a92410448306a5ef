//! 显著性打分
//!
//! 每个事件得到一个标量分数加七个命名维度。路由优先级取 max(score, threat)：
//! 威胁维度单独保底，习惯化只压制标量分数、永远不参与取最大值。
//! 打分用关键词族匹配（无需网络调用），外部算好的显著性向量优先于本地打分。

use serde::{Deserialize, Serialize};

/// 显著性结果：标量分数 + 七个维度，全部落在 [0,1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalienceResult {
    /// 综合标量分数
    pub score: f64,
    /// 新颖度（没见过的事件更高）
    pub novelty: f64,
    /// 目标相关度（日程/任务/截止时间）
    pub goal_relevance: f64,
    /// 机会（优惠/奖励类）
    pub opportunity: f64,
    /// 可行动性（存在明确下一步动作）
    pub actionability: f64,
    /// 社交（消息/提及/邀请）
    pub social: f64,
    /// 威胁（告警/故障/危险）
    pub threat: f64,
    /// 习惯化（同类事件反复出现后的钝化）
    pub habituation: f64,
}

impl SalienceResult {
    /// 所有维度取同一中位值的中性结果（缓存不可用时的默认）
    pub fn neutral(level: f64) -> Self {
        let level = level.clamp(0.0, 1.0);
        Self {
            score: level,
            novelty: level,
            goal_relevance: level,
            opportunity: level,
            actionability: level,
            social: level,
            threat: level,
            habituation: level,
        }
    }

    /// 路由优先级：标量分数与威胁取大，习惯化不参与
    pub fn priority(&self) -> f64 {
        self.score.max(self.threat)
    }
}

/// 威胁类关键词
const THREAT_KEYWORDS: &[&str] = &[
    "alert", "warning", "critical", "danger", "emergency", "failed", "failure",
    "error", "down", "breach", "attack", "low health", "overheating",
];

/// 机会类关键词
const OPPORTUNITY_KEYWORDS: &[&str] = &[
    "discount", "offer", "deal", "available", "bonus", "reward", "free", "sale",
];

/// 社交类关键词
const SOCIAL_KEYWORDS: &[&str] = &[
    "message", "mention", "reply", "invite", "friend", "call", "comment", "shared",
];

/// 目标相关类关键词
const GOAL_KEYWORDS: &[&str] = &[
    "reminder", "deadline", "due", "task", "schedule", "meeting", "appointment", "goal",
];

/// 可行动类关键词
const ACTION_KEYWORDS: &[&str] = &[
    "confirm", "approve", "respond", "fix", "restart", "update", "renew", "pay",
];

/// 关键词族打分器
///
/// 维度分 = 命中数 × 0.4（封顶 1.0）；综合分是各维度的加权和，
/// 再按命中条目的历史次数做习惯化衰减。
pub struct SalienceScorer {
    /// 习惯化窗口：命中多少次视为完全钝化
    habituation_window: f64,
}

impl SalienceScorer {
    pub fn new(habituation_window: f64) -> Self {
        Self {
            habituation_window: habituation_window.max(1.0),
        }
    }

    /// 给事件文本打分
    ///
    /// `matched_confidence`：缓存命中时该启发式的置信度（抬高可行动性）；
    /// `hit_count`：命中条目的累计次数，驱动习惯化。
    pub fn score(&self, text: &str, matched_confidence: Option<f64>, hit_count: u64) -> SalienceResult {
        let lower = text.to_lowercase();

        let threat = keyword_score(&lower, THREAT_KEYWORDS);
        let opportunity = keyword_score(&lower, OPPORTUNITY_KEYWORDS);
        let social = keyword_score(&lower, SOCIAL_KEYWORDS);
        let goal_relevance = keyword_score(&lower, GOAL_KEYWORDS);

        let actionability = keyword_score(&lower, ACTION_KEYWORDS)
            .max(matched_confidence.unwrap_or(0.0))
            .clamp(0.0, 1.0);

        // 命中过的事件不再新鲜
        let novelty = if matched_confidence.is_some() { 0.3 } else { 0.7 };

        let habituation = (hit_count as f64 / self.habituation_window).min(1.0);

        let weighted = threat * 0.30
            + goal_relevance * 0.20
            + actionability * 0.15
            + novelty * 0.15
            + opportunity * 0.10
            + social * 0.10;
        let score = (weighted * (1.0 - habituation * 0.5)).clamp(0.0, 1.0);

        SalienceResult {
            score,
            novelty,
            goal_relevance,
            opportunity,
            actionability,
            social,
            threat,
            habituation,
        }
    }
}

fn keyword_score(lower: &str, keywords: &[&str]) -> f64 {
    let hits = keywords.iter().filter(|k| lower.contains(*k)).count();
    (hits as f64 * 0.4).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_salience() {
        let s = SalienceResult::neutral(0.5);
        assert_eq!(s.score, 0.5);
        assert_eq!(s.threat, 0.5);
        assert_eq!(s.habituation, 0.5);
        assert_eq!(s.priority(), 0.5);
    }

    #[test]
    fn test_neutral_clamps_level() {
        let s = SalienceResult::neutral(1.7);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn test_threat_keywords_raise_threat() {
        let scorer = SalienceScorer::new(10.0);
        let calm = scorer.score("the weather is nice today", None, 0);
        let alarmed = scorer.score("Critical alert: disk failure detected", None, 0);
        assert!(alarmed.threat > calm.threat);
        assert!(alarmed.threat >= 0.8);
    }

    #[test]
    fn test_priority_prefers_threat_over_score() {
        let mut s = SalienceResult::neutral(0.2);
        s.threat = 0.9;
        assert_eq!(s.priority(), 0.9);
    }

    #[test]
    fn test_habituation_dampens_score_not_threat() {
        let scorer = SalienceScorer::new(10.0);
        let fresh = scorer.score("warning: battery low", Some(0.8), 0);
        let stale = scorer.score("warning: battery low", Some(0.8), 10);
        assert!(stale.score < fresh.score);
        assert_eq!(stale.threat, fresh.threat);
        assert_eq!(stale.habituation, 1.0);
    }

    #[test]
    fn test_matched_confidence_raises_actionability() {
        let scorer = SalienceScorer::new(10.0);
        let unmatched = scorer.score("something happened", None, 0);
        let matched = scorer.score("something happened", Some(0.9), 0);
        assert!(matched.actionability > unmatched.actionability);
        assert!(matched.novelty < unmatched.novelty);
    }
}
