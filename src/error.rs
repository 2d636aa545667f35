//! 引擎错误类型
//!
//! 各组件向编排器抛出带类型的 EngineError；编排器将步骤失败折叠为
//! 聚合结果中的逐步状态，而不是向调用方抛裸异常。

use thiserror::Error;

/// 核心引擎错误（规划不可行、记录缺失、数据完整性、增强失败、限流、存储）
#[derive(Error, Debug)]
pub enum EngineError {
    /// 不存在可行的排期方案（可用时间为空、考试日期已过、无空闲槽位等）。
    /// 对当前操作是致命的，不重试。
    #[error("Plan infeasible: {0}")]
    PlanInfeasible(String),

    /// 用户 / 计划 / 主题 / 任务等记录缺失，对当前调用致命
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 数据完整性被破坏（前置依赖成环、任务时间重叠等）。
    /// 必须上抛，不允许静默修复。
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    /// 调用方传入的参数无法解析
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// 可选的自然语言增强失败；规则产出仍然有效，调用方永远不因此失败
    #[error("Enrichment unavailable: {0}")]
    Enrichment(String),

    /// 建议性限流：同一（用户, 端点类别）冷却窗口内的重复触发
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    /// 底层存储错误
    #[error("Store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(format!("serialization: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
