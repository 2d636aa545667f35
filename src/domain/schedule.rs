//! 调度条目：周期 / 一次性的 Agent 触发计划
//!
//! 条目由 Agent Scheduler 独占持有：enable/disable/update 与
//! 到期处理器推进 next_run 是仅有的修改途径。claimed_at 是
//! 「执行中」CAS 标记，保证重叠扫描对同一到期最多执行一次。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use uuid::Uuid;

use super::task::Priority;
use super::UserId;

/// 可编排的 Agent 类别（封闭枚举，非法类别在编译期即不存在）。
/// Scheduler 指学习计划构建器，区别于驱动它的 Agent Scheduler。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    Scheduler,
    Monitor,
    Adaptation,
    Remediation,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Scheduler => "scheduler",
            AgentKind::Monitor => "monitor",
            AgentKind::Adaptation => "adaptation",
            AgentKind::Remediation => "remediation",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 固定序列：standard = Monitor→Adaptation；comprehensive 再加 Remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceKind {
    Standard,
    Comprehensive,
}

impl SequenceKind {
    pub fn steps(self) -> &'static [AgentKind] {
        match self {
            SequenceKind::Standard => &[AgentKind::Monitor, AgentKind::Adaptation],
            SequenceKind::Comprehensive => &[
                AgentKind::Monitor,
                AgentKind::Adaptation,
                AgentKind::Remediation,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SequenceKind::Standard => "standard",
            SequenceKind::Comprehensive => "comprehensive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// 执行一次后自动禁用
    OneTime,
    /// 每次执行后 next_run 前移 interval
    Recurring,
}

/// 一条调度计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub agent: AgentKind,
    /// 存在时执行整条序列而非单个 Agent
    pub sequence: Option<SequenceKind>,
    pub schedule_kind: ScheduleKind,
    /// None 表示按用户扇出：对每个持有计划的用户各执行一次
    pub user_id: Option<UserId>,
    pub interval_minutes: i64,
    #[serde(default)]
    pub priority: Priority,
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    /// 执行中标记；超过 stale 窗口的陈旧认领可被重新认领
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// 到期判定：已启用且 next_run 不晚于 now
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_minutes)
    }

    /// 为单个用户构造标准监控条目（扇出辅助使用）
    pub fn standard_monitoring(
        user_id: UserId,
        interval_minutes: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: AgentKind::Monitor,
            sequence: Some(SequenceKind::Standard),
            schedule_kind: ScheduleKind::Recurring,
            user_id: Some(user_id),
            interval_minutes,
            priority: Priority::Medium,
            enabled: true,
            params: Value::Null,
            next_run: now,
            last_run: None,
            last_outcome: None,
            claimed_at: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_due_requires_enabled() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let mut entry = ScheduleEntry::standard_monitoring("u1".into(), 60, now);
        assert!(entry.is_due(now));
        entry.enabled = false;
        assert!(!entry.is_due(now));
        entry.enabled = true;
        entry.next_run = now + Duration::minutes(1);
        assert!(!entry.is_due(now));
    }

    #[test]
    fn test_sequence_steps() {
        assert_eq!(SequenceKind::Standard.steps().len(), 2);
        assert_eq!(
            SequenceKind::Comprehensive.steps().last(),
            Some(&AgentKind::Remediation)
        );
    }
}
