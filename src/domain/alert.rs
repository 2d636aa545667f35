//! 告警与调整审计记录
//!
//! Alert 由 Monitor / Remediation 创建，靠显式动作或清理逻辑解除；
//! Adaptation 是日历变更的只追加审计，创建后不再修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PlanId, TaskId, TopicId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    MissedTask,
    LowPerformance,
    Remediation,
    General,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::MissedTask => "missed_task",
            AlertType::LowPerformance => "low_performance",
            AlertType::Remediation => "remediation",
            AlertType::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// 系统告警；同一用户同类型的未解除告警只保留一条（创建前去重）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub related_task_id: Option<TaskId>,
    pub related_topic_id: Option<TopicId>,
    /// 结构化附加信息（scheduled_task_id、suggested_action 等）
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// 向 meta 对象写入一个键（meta 非对象时先置空对象）
    pub fn meta_insert(&mut self, key: &str, value: Value) {
        if !self.meta.is_object() {
            self.meta = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.meta.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.is_resolved = true;
        self.resolved_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptationType {
    RescheduleTask,
    AdjustDifficulty,
    AddReviewSession,
    RebalanceWorkload,
    /// 补救动作与后续表现的关联审计（效果追踪）
    RemediationOutcome,
}

impl AdaptationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AdaptationType::RescheduleTask => "reschedule_task",
            AdaptationType::AdjustDifficulty => "adjust_difficulty",
            AdaptationType::AddReviewSession => "add_review_session",
            AdaptationType::RebalanceWorkload => "rebalance_workload",
            AdaptationType::RemediationOutcome => "remediation_outcome",
        }
    }
}

/// 日历调整审计记录（不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adaptation {
    pub id: String,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub adaptation_type: AdaptationType,
    pub description: String,
    pub reason: String,
    pub task_id: Option<TaskId>,
    pub topic_id: Option<TopicId>,
    #[serde(default)]
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

/// 补救动作类别（效果追踪用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemediationAction {
    ScheduleReview,
    AdjustDifficulty,
    AddContent,
}

impl RemediationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RemediationAction::ScheduleReview => "schedule_review",
            RemediationAction::AdjustDifficulty => "adjust_difficulty",
            RemediationAction::AddContent => "add_content",
        }
    }
}
