//! 任务存储适配层
//!
//! 引擎只依赖按字段过滤的 CRUD 语义，不绑定具体存储技术。
//! 两个后端（内存 / SQLite）共用同一套不变量校验：任务时间合法、
//! 同计划任务区间不重叠、同一用户最多一个未过期计划。
//! plan_mutex 暴露按计划粒度的互斥锁，写路径（状态迁移、自适应、
//! 补救）在读-查-写之间持锁，读路径不加锁。

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Adaptation, Alert, AlertType, Performance, PlanId, ReadinessScore, ScheduleEntry,
    StudyPlan, Task, TaskStatus, TaskType, Topic, TopicId, UserId,
};
use crate::error::{EngineError, EngineResult};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// 任务查询谓词；None 字段不过滤
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub plan_id: Option<PlanId>,
    pub topic_id: Option<TopicId>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub task_type: Option<TaskType>,
    /// 仅保留补救任务（meta.is_remediation）
    pub remediation_only: bool,
    pub starts_after: Option<DateTime<Utc>>,
    pub ends_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn for_plan(plan_id: impl Into<PlanId>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(plan) = &self.plan_id {
            if &task.plan_id != plan {
                return false;
            }
        }
        if let Some(topic) = &self.topic_id {
            if &task.topic_id != topic {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(ty) = self.task_type {
            if task.task_type != ty {
                return false;
            }
        }
        if self.remediation_only && !task.meta.is_remediation {
            return false;
        }
        if let Some(after) = self.starts_after {
            match task.start_time {
                Some(start) if start >= after => {}
                _ => return false,
            }
        }
        if let Some(before) = self.ends_before {
            match task.end_time {
                Some(end) if end < before => {}
                _ => return false,
            }
        }
        true
    }
}

/// 告警查询谓词
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub user_id: Option<UserId>,
    pub alert_type: Option<AlertType>,
    pub unresolved_only: bool,
    pub related_task_id: Option<String>,
}

impl AlertFilter {
    pub fn unresolved(user_id: impl Into<UserId>, alert_type: AlertType) -> Self {
        Self {
            user_id: Some(user_id.into()),
            alert_type: Some(alert_type),
            unresolved_only: true,
            related_task_id: None,
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(user) = &self.user_id {
            if &alert.user_id != user {
                return false;
            }
        }
        if let Some(ty) = self.alert_type {
            if alert.alert_type != ty {
                return false;
            }
        }
        if self.unresolved_only && alert.is_resolved {
            return false;
        }
        if let Some(task) = &self.related_task_id {
            if alert.related_task_id.as_deref() != Some(task.as_str()) {
                return false;
            }
        }
        true
    }
}

/// 成绩查询谓词
#[derive(Debug, Clone, Default)]
pub struct PerformanceFilter {
    pub user_id: Option<UserId>,
    pub task_id: Option<String>,
    pub topic_id: Option<TopicId>,
}

impl PerformanceFilter {
    pub fn for_user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, perf: &Performance) -> bool {
        if let Some(user) = &self.user_id {
            if &perf.user_id != user {
                return false;
            }
        }
        if let Some(task) = &self.task_id {
            if &perf.task_id != task {
                return false;
            }
        }
        if let Some(topic) = &self.topic_id {
            if &perf.topic_id != topic {
                return false;
            }
        }
        true
    }
}

/// 写入前校验：时间不变量 + 同计划区间不重叠。
/// existing 是同计划的既有任务（更新时排除自身）。
pub(crate) fn validate_task_write(task: &Task, existing: &[Task]) -> EngineResult<()> {
    task.validate_times()?;
    for other in existing {
        if other.id != task.id && task.overlaps(other) {
            return Err(EngineError::DataIntegrity(format!(
                "task '{}' overlaps task '{}' in plan '{}'",
                task.id, other.id, task.plan_id
            )));
        }
    }
    Ok(())
}

/// 计划插入校验：同一用户最多一个未过期计划
pub(crate) fn validate_plan_insert(
    plan: &StudyPlan,
    existing: &[StudyPlan],
    now: DateTime<Utc>,
) -> EngineResult<()> {
    if existing
        .iter()
        .any(|p| p.user_id == plan.user_id && p.is_active(now) && p.id != plan.id)
    {
        return Err(EngineError::DataIntegrity(format!(
            "user '{}' already has an active study plan",
            plan.user_id
        )));
    }
    Ok(())
}

/// 类型化的按过滤器 CRUD 存储接口
#[async_trait]
pub trait StudyStore: Send + Sync {
    // --- Topic（引擎只读写入一次，不创建新主题）---
    async fn insert_topic(&self, topic: Topic) -> EngineResult<()>;
    async fn topic(&self, id: &str) -> EngineResult<Option<Topic>>;
    async fn topics(&self) -> EngineResult<Vec<Topic>>;

    // --- StudyPlan ---
    async fn insert_plan(&self, plan: StudyPlan, now: DateTime<Utc>) -> EngineResult<()>;
    async fn plan(&self, id: &str) -> EngineResult<Option<StudyPlan>>;
    /// 用户当前未过期的计划（按创建时间取最新）
    async fn active_plan(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<StudyPlan>>;
    /// 持有计划的全部用户（扇出辅助使用）
    async fn user_ids(&self) -> EngineResult<Vec<UserId>>;

    // --- Task ---
    async fn insert_task(&self, task: Task) -> EngineResult<()>;
    async fn update_task(&self, task: Task) -> EngineResult<()>;
    async fn task(&self, id: &str) -> EngineResult<Option<Task>>;
    async fn tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>>;
    async fn delete_task(&self, id: &str) -> EngineResult<bool>;

    // --- Performance ---
    async fn insert_performance(&self, perf: Performance) -> EngineResult<()>;
    async fn performances(&self, filter: &PerformanceFilter) -> EngineResult<Vec<Performance>>;
    async fn delete_performances_for_task(&self, task_id: &str) -> EngineResult<usize>;

    // --- ReadinessScore（只追加）---
    async fn insert_readiness(&self, score: ReadinessScore) -> EngineResult<()>;
    async fn latest_readiness(&self, user_id: &str) -> EngineResult<Option<ReadinessScore>>;

    // --- Alert ---
    async fn insert_alert(&self, alert: Alert) -> EngineResult<()>;
    async fn update_alert(&self, alert: Alert) -> EngineResult<()>;
    async fn alert(&self, id: &str) -> EngineResult<Option<Alert>>;
    async fn alerts(&self, filter: &AlertFilter) -> EngineResult<Vec<Alert>>;
    async fn delete_alert(&self, id: &str) -> EngineResult<bool>;

    // --- Adaptation（只追加审计）---
    async fn insert_adaptation(&self, adaptation: Adaptation) -> EngineResult<()>;
    async fn adaptations(&self, user_id: &str) -> EngineResult<Vec<Adaptation>>;

    /// 按计划粒度的互斥锁；同一 plan_id 始终返回同一把锁
    async fn plan_mutex(&self, plan_id: &str) -> Arc<Mutex<()>>;
}

/// 调度条目存储：注入式抽象，进程重启与水平扩展都不丢失调度。
/// claim_due 必须是对 claimed_at 的原子比较并交换——这是
/// 「每个到期最多执行一次」的正确性来源，过期认领按 stale 窗口回收。
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_entry(&self, entry: ScheduleEntry) -> EngineResult<()>;
    async fn update_entry(&self, entry: ScheduleEntry) -> EngineResult<()>;
    async fn delete_entry(&self, id: &str) -> EngineResult<bool>;
    async fn entry(&self, id: &str) -> EngineResult<Option<ScheduleEntry>>;
    async fn entries(&self) -> EngineResult<Vec<ScheduleEntry>>;
    async fn entries_for_user(&self, user_id: &str) -> EngineResult<Vec<ScheduleEntry>>;
    /// 原子认领全部到期条目：已启用、next_run ≤ now，且无未过期的在途认领
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> EngineResult<Vec<ScheduleEntry>>;
    /// 执行完毕：清除认领标记，记录 last_run 与结果，写回 next_run / enabled
    async fn finish_entry(
        &self,
        id: &str,
        now: DateTime<Utc>,
        outcome: &str,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> EngineResult<()>;
}
