//! Mock Summarizer（用于测试与无 API Key 场景）
//!
//! 用模板把统计拼成固定格式文本，保证离线可跑通完整管线。

use async_trait::async_trait;

use crate::domain::{Adaptation, Alert};
use crate::engine::monitor::PlanStats;
use crate::error::EngineResult;

use super::Summarizer;

/// Mock 实现：确定性模板输出
#[derive(Debug, Default)]
pub struct MockSummarizer;

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize_monitor(
        &self,
        stats: &PlanStats,
        alerts: &[Alert],
    ) -> EngineResult<String> {
        Ok(format!(
            "You completed {}/{} tasks ({} missed). {} new alert(s).",
            stats.completed_tasks,
            stats.total_tasks,
            stats.missed_tasks,
            alerts.len()
        ))
    }

    async fn suggest_adaptations(&self, adaptations: &[Adaptation]) -> EngineResult<String> {
        Ok(format!(
            "{} adjustment(s) applied; keep following the updated calendar.",
            adaptations.len()
        ))
    }
}
