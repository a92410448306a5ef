//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REFLEX__*` 覆盖（双下划线表示嵌套，
//! 如 `REFLEX__QUEUE__SLA_MS=2000`）。所有阈值都有内置默认值，不带配置文件也能跑。
//! 配置在构造期一次性快照进各组件，运行期不做全局可变状态。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub strategy: StrategySection,
    #[serde(default)]
    pub learning: LearningSection,
    #[serde(default)]
    pub reasoner: ReasonerSection,
    #[serde(default)]
    pub embedding: EmbeddingSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheSection::default(),
            router: RouterSection::default(),
            queue: QueueSection::default(),
            strategy: StrategySection::default(),
            learning: LearningSection::default(),
            reasoner: ReasonerSection::default(),
            embedding: EmbeddingSection::default(),
        }
    }
}

/// [cache] 段：容量、语义匹配阈值、习惯化窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// 最大条目数，超出按 LRU 淘汰
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: usize,
    /// 语义命中的余弦相似度下限（偏保守：拒绝结构相似但语义无关的文本）
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// 习惯化窗口：同一条目命中多少次视为完全钝化
    #[serde(default = "default_habituation_window")]
    pub habituation_window: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            similarity_threshold: default_similarity_threshold(),
            habituation_window: default_habituation_window(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}

fn default_similarity_threshold() -> f64 {
    0.7
}

fn default_habituation_window() -> f64 {
    10.0
}

/// [router] 段：紧急快路双阈值、候选数量、中性显著性
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 紧急快路的置信度下限（与威胁下限必须同时满足）
    #[serde(default = "default_emergency_confidence")]
    pub emergency_confidence_threshold: f64,
    /// 紧急快路的威胁维度下限
    #[serde(default = "default_emergency_threat")]
    pub emergency_threat_threshold: f64,
    /// 单次决策最多携带的候选数（含最佳命中）
    #[serde(default = "default_max_candidates")]
    pub max_evaluation_candidates: usize,
    /// 缓存不可用时所有维度的默认中位值
    #[serde(default = "default_neutral_salience")]
    pub neutral_salience: f64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            emergency_confidence_threshold: default_emergency_confidence(),
            emergency_threat_threshold: default_emergency_threat(),
            max_evaluation_candidates: default_max_candidates(),
            neutral_salience: default_neutral_salience(),
        }
    }
}

fn default_emergency_confidence() -> f64 {
    0.85
}

fn default_emergency_threat() -> f64 {
    0.9
}

fn default_max_candidates() -> usize {
    4
}

fn default_neutral_salience() -> f64 {
    0.5
}

/// [queue] 段：SLA、worker 数、超时扫描间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 事件入队到必须产生响应的时限（毫秒）
    #[serde(default = "default_sla_ms")]
    pub sla_ms: u64,
    /// worker 数量（0 表示只入队不消费，供测试超时路径）
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 超时扫描间隔（毫秒）
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            sla_ms: default_sla_ms(),
            workers: default_workers(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

fn default_sla_ms() -> u64 {
    5000
}

fn default_workers() -> usize {
    2
}

fn default_scan_interval_ms() -> u64 {
    200
}

/// [strategy] 段：启发式优先策略的阈值与推理端并发限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySection {
    /// 策略名（工厂函数据此选择变体）
    #[serde(default = "default_strategy_name")]
    pub name: String,
    /// 启发式短路的基准置信度阈值
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f64,
    /// 按用户个性微调的偏置，叠加后整体钳制到 [0.3, 0.95]
    #[serde(default)]
    pub personality_bias: f64,
    /// 推理端输出与候选动作的背书相似度下限
    #[serde(default = "default_endorsement_threshold")]
    pub endorsement_threshold: f64,
    /// 背书正反馈的幅度权重（实际幅度 = 权重 × 相似度）
    #[serde(default = "default_endorsement_boost")]
    pub endorsement_boost: f64,
    /// 推理端自评成功率的上限（防止未经验证的高置信自评）
    #[serde(default = "default_predicted_success_ceiling")]
    pub predicted_success_ceiling: f64,
    /// 自评解析失败时的默认成功率
    #[serde(default = "default_predicted_success")]
    pub default_predicted_success: f64,
    /// 同时在途的推理端调用上限（系统对昂贵资源的背压点）
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// 单次生成调用超时（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 自评调用超时（毫秒），单独计界
    #[serde(default = "default_assess_timeout_ms")]
    pub assess_timeout_ms: u64,
    /// 推理端无输出时的降级文案
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            base_threshold: default_base_threshold(),
            personality_bias: 0.0,
            endorsement_threshold: default_endorsement_threshold(),
            endorsement_boost: default_endorsement_boost(),
            predicted_success_ceiling: default_predicted_success_ceiling(),
            default_predicted_success: default_predicted_success(),
            max_concurrent_calls: default_max_concurrent_calls(),
            request_timeout_ms: default_request_timeout_ms(),
            assess_timeout_ms: default_assess_timeout_ms(),
            fallback_message: default_fallback_message(),
        }
    }
}

fn default_strategy_name() -> String {
    "heuristic_first".to_string()
}

fn default_base_threshold() -> f64 {
    0.7
}

fn default_endorsement_threshold() -> f64 {
    0.75
}

fn default_endorsement_boost() -> f64 {
    0.5
}

fn default_predicted_success_ceiling() -> f64 {
    0.8
}

fn default_predicted_success() -> f64 {
    0.5
}

fn default_max_concurrent_calls() -> usize {
    4
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_assess_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_message() -> String {
    "No automated response is available for this event.".to_string()
}

/// 结果模式：触发词 / 期望结果词 / 时限 / 成败极性
///
/// 启发式触发（fire）时若条件文本包含 trigger，则登记一条待定结果；
/// 之后时限内出现含 expected 的事件按 success 极性反馈，到期未出现视为隐式成功。
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomePatternConfig {
    pub trigger: String,
    pub expected: String,
    #[serde(default = "default_outcome_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_outcome_success")]
    pub success: bool,
}

fn default_outcome_timeout_secs() -> u64 {
    300
}

fn default_outcome_success() -> bool {
    true
}

/// [learning] 段：各反馈通道的幅度、无视计数阈值、撤销窗口、结果模式表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningSection {
    /// 显式反馈幅度
    #[serde(default = "default_explicit_magnitude")]
    pub explicit_magnitude: f64,
    /// 结果模式命中的反馈幅度
    #[serde(default = "default_outcome_magnitude")]
    pub outcome_magnitude: f64,
    /// 到期视为成功（沉默即可接受）的反馈幅度
    #[serde(default = "default_timeout_magnitude")]
    pub timeout_magnitude: f64,
    /// 撤销关键词触发的负反馈幅度
    #[serde(default = "default_undo_magnitude")]
    pub undo_magnitude: f64,
    /// 反复无视触发的负反馈幅度
    #[serde(default = "default_ignored_magnitude")]
    pub ignored_magnitude: f64,
    /// 无视多少次后发一条负反馈
    #[serde(default = "default_ignored_threshold")]
    pub ignored_threshold: u32,
    /// 撤销窗口（秒）：窗口内 fire 过的启发式都吃撤销负反馈
    #[serde(default = "default_undo_window_secs")]
    pub undo_window_secs: u64,
    /// 撤销关键词
    #[serde(default = "default_undo_keywords")]
    pub undo_keywords: Vec<String>,
    /// 最近 fire 记录的保留条数
    #[serde(default = "default_max_tracked_fires")]
    pub max_tracked_fires: usize,
    /// 待定结果到期清扫间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 结果模式表
    #[serde(default = "default_outcome_patterns")]
    pub outcome_patterns: Vec<OutcomePatternConfig>,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            explicit_magnitude: default_explicit_magnitude(),
            outcome_magnitude: default_outcome_magnitude(),
            timeout_magnitude: default_timeout_magnitude(),
            undo_magnitude: default_undo_magnitude(),
            ignored_magnitude: default_ignored_magnitude(),
            ignored_threshold: default_ignored_threshold(),
            undo_window_secs: default_undo_window_secs(),
            undo_keywords: default_undo_keywords(),
            max_tracked_fires: default_max_tracked_fires(),
            sweep_interval_secs: default_sweep_interval_secs(),
            outcome_patterns: default_outcome_patterns(),
        }
    }
}

fn default_explicit_magnitude() -> f64 {
    0.8
}

fn default_outcome_magnitude() -> f64 {
    0.6
}

fn default_timeout_magnitude() -> f64 {
    0.3
}

fn default_undo_magnitude() -> f64 {
    0.6
}

fn default_ignored_magnitude() -> f64 {
    0.4
}

fn default_ignored_threshold() -> u32 {
    3
}

fn default_undo_window_secs() -> u64 {
    30
}

fn default_undo_keywords() -> Vec<String> {
    vec![
        "undo".into(),
        "revert".into(),
        "cancel that".into(),
        "never mind".into(),
    ]
}

fn default_max_tracked_fires() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_outcome_patterns() -> Vec<OutcomePatternConfig> {
    vec![
        OutcomePatternConfig {
            trigger: "low health".into(),
            expected: "health restored".into(),
            timeout_secs: 300,
            success: true,
        },
        OutcomePatternConfig {
            trigger: "reminder".into(),
            expected: "completed".into(),
            timeout_secs: 600,
            success: true,
        },
        OutcomePatternConfig {
            trigger: "warning".into(),
            expected: "escalated".into(),
            timeout_secs: 300,
            success: false,
        },
    ]
}

/// [reasoner] 段：推理端选择与提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasonerSection {
    /// 后端：openai / mock / none
    #[serde(default = "default_reasoner_provider")]
    pub provider: String,
    #[serde(default = "default_reasoner_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 生成调用的系统提示
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ReasonerSection {
    fn default() -> Self {
        Self {
            provider: default_reasoner_provider(),
            model: default_reasoner_model(),
            base_url: None,
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_reasoner_provider() -> String {
    "mock".to_string()
}

fn default_reasoner_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are the decision core of a personal assistant. \
     Given an incoming event, produce one short, directly actionable response."
        .to_string()
}

/// [embedding] 段：嵌入端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    /// 是否启用语义匹配（关闭后缓存只走词面命中）
    #[serde(default = "default_embedding_enabled")]
    pub enabled: bool,
    /// 后端：openai / mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            enabled: default_embedding_enabled(),
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: None,
        }
    }
}

fn default_embedding_enabled() -> bool {
    true
}

fn default_embedding_provider() -> String {
    "mock".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// 从 config 目录加载配置，环境变量 REFLEX__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REFLEX__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REFLEX")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
