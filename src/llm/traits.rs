//! Summarizer 抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 Summarizer：
//! summarize_monitor（监控摘要）、suggest_adaptations（调整建议）。

use async_trait::async_trait;

use crate::domain::{Adaptation, Alert};
use crate::engine::monitor::PlanStats;
use crate::error::EngineResult;

/// 自然语言增强接口；失败返回 EngineError::Enrichment，调用方可忽略
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// 根据统计与新告警生成一段面向学习者的摘要
    async fn summarize_monitor(
        &self,
        stats: &PlanStats,
        alerts: &[Alert],
    ) -> EngineResult<String>;

    /// 针对一轮日历调整给出补充建议
    async fn suggest_adaptations(&self, adaptations: &[Adaptation]) -> EngineResult<String>;
}
