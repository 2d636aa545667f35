//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OWL__*` 覆盖
//! （双下划线表示嵌套，如 `OWL__MONITOR__READINESS_ALERT=70`）。
//! 各引擎的阈值全部集中在这里，代码里不散落魔法数字。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub plan: PlanSection,
    pub readiness: ReadinessSection,
    pub monitor: MonitorSection,
    pub adaptation: AdaptationSection,
    pub remediation: RemediationSection,
    pub ratelimit: RateLimitSection,
    pub scheduler: SchedulerSection,
    pub llm: LlmSection,
}

/// [app] 段：应用名与可选的 SQLite 路径（未设置时使用内存存储）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub db_path: Option<PathBuf>,
}

/// [plan] 段：排期器参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanSection {
    /// 超过该分钟数的单日记为「过载」告警（校验报告用，不阻塞落库）
    pub daily_cap_min: i64,
    /// 单次学习会话的时长上限
    pub session_max_min: i64,
    /// 诊断弱项主题的时间分配加权
    pub weak_boost: f64,
}

impl Default for PlanSection {
    fn default() -> Self {
        Self {
            daily_cap_min: 240,
            session_max_min: 90,
            weak_boost: 1.5,
        }
    }
}

/// [readiness] 段：就绪度评分阈值与无分数代理值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessSection {
    pub weak_threshold: f64,
    pub strong_threshold: f64,
    /// 非计分任务完成时的分数代理
    pub proxy_completed: f64,
    pub proxy_incomplete: f64,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            weak_threshold: 65.0,
            strong_threshold: 80.0,
            proxy_completed: 70.0,
            proxy_incomplete: 25.0,
        }
    }
}

/// [monitor] 段：告警规则阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub missed_ratio_alert: f64,
    pub missed_ratio_high: f64,
    pub low_performance_alert: f64,
    pub low_performance_high: f64,
    pub readiness_alert: f64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            missed_ratio_alert: 0.20,
            missed_ratio_high: 0.30,
            low_performance_alert: 60.0,
            low_performance_high: 50.0,
            readiness_alert: 65.0,
        }
    }
}

/// [adaptation] 段：难度调整滞回带，防止单样本来回震荡
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptationSection {
    /// 连续样本数下限
    pub hysteresis_window: usize,
    pub lower_below: f64,
    pub raise_above: f64,
}

impl Default for AdaptationSection {
    fn default() -> Self {
        Self {
            hysteresis_window: 3,
            lower_below: 50.0,
            raise_above: 85.0,
        }
    }
}

/// [remediation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemediationSection {
    /// 每用户保留的 General 告警条数上限
    pub general_alert_cap: usize,
    /// 主题无预估时长时补救复习的默认分钟数
    pub default_review_min: i64,
}

impl Default for RemediationSection {
    fn default() -> Self {
        Self {
            general_alert_cap: 10,
            default_review_min: 45,
        }
    }
}

/// [ratelimit] 段：按（用户, 端点类别）的固定冷却窗口（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub plan_cooldown_secs: i64,
    pub monitor_cooldown_secs: i64,
    pub adaptation_cooldown_secs: i64,
    pub remediation_cooldown_secs: i64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            plan_cooldown_secs: 1800,
            monitor_cooldown_secs: 600,
            adaptation_cooldown_secs: 600,
            remediation_cooldown_secs: 300,
        }
    }
}

/// [scheduler] 段：到期扫描参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 在途认领超过该秒数视为陈旧，可被下次扫描回收
    pub stale_claim_secs: i64,
    /// 扇出创建的标准监控条目默认间隔（分钟）
    pub default_interval_min: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            stale_claim_secs: 600,
            default_interval_min: 1440,
        }
    }
}

/// [llm] 段：可选自然语言增强的后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；没有 API Key 时自动退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 OWL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OWL__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("OWL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
