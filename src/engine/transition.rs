//! 任务状态迁移（显式事务化操作）
//!
//! 完成任务会隐式补一条成绩、回退会删除成绩——这些副作用集中在
//! apply_status_transition 一个入口完成并在返回值里如实上报，
//! 测试可以直接断言，而不必从两次独立写入反推。
//! 每次状态变化之后触发一次就绪度重算（尽力而为）。

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Performance, TaskStatus};
use crate::error::{EngineError, EngineResult};
use crate::store::PerformanceFilter;

use super::{readiness, EngineCtx};

/// 一次状态迁移实际执行的副作用
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// 进入 Completed 时补写的成绩记录 id（已有成绩则为 None）
    pub performance_created: Option<String>,
    /// 离开 Completed 时删除的成绩记录数
    pub performances_deleted: usize,
    pub readiness_recomputed: bool,
}

/// 应用一次状态迁移；非法迁移是 DataIntegrity 错误。
/// 同状态重复提交视为幂等 no-op。
pub async fn apply_status_transition(
    ctx: &EngineCtx,
    task_id: &str,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> EngineResult<TransitionOutcome> {
    let probe = ctx
        .store
        .task(task_id)
        .await?
        .ok_or_else(|| EngineError::not_found("task", task_id))?;

    // 写路径按计划串行化，完成补写/回退删除不会与并发调整交错
    let lock = ctx.store.plan_mutex(&probe.plan_id).await;
    let _guard = lock.lock().await;

    let mut task = ctx
        .store
        .task(task_id)
        .await?
        .ok_or_else(|| EngineError::not_found("task", task_id))?;
    let from = task.status;

    if from == to {
        return Ok(TransitionOutcome {
            task_id: task_id.to_string(),
            from,
            to,
            performance_created: None,
            performances_deleted: 0,
            readiness_recomputed: false,
        });
    }
    if !from.can_transition(to) {
        return Err(EngineError::DataIntegrity(format!(
            "illegal status transition {} -> {} for task '{}'",
            from.as_str(),
            to.as_str(),
            task_id
        )));
    }

    let plan = ctx
        .store
        .plan(&task.plan_id)
        .await?
        .ok_or_else(|| EngineError::not_found("plan", &task.plan_id))?;

    task.status = to;
    ctx.store.update_task(task.clone()).await?;

    // 进入 Completed：若该任务还没有成绩记录则补一条
    let mut performance_created = None;
    if to == TaskStatus::Completed {
        let existing = ctx
            .store
            .performances(&PerformanceFilter {
                task_id: Some(task_id.to_string()),
                ..PerformanceFilter::default()
            })
            .await?;
        if existing.is_empty() {
            let perf = Performance {
                id: Uuid::new_v4().to_string(),
                user_id: plan.user_id.clone(),
                task_id: task_id.to_string(),
                topic_id: task.topic_id.clone(),
                content_ref: task.content_ref.clone(),
                score: None,
                time_spent_min: task.duration_min,
                completed: true,
                confidence: 3,
                answers: vec![],
                created_at: now,
            };
            performance_created = Some(perf.id.clone());
            ctx.store.insert_performance(perf).await?;
        }
    }

    // 离开 Completed（回退 Pending）：删除挂在该任务上的成绩
    let performances_deleted = if from == TaskStatus::Completed {
        ctx.store.delete_performances_for_task(task_id).await?
    } else {
        0
    };

    drop(_guard);

    // 就绪度重算尽力而为：失败只记日志，不影响迁移本身
    let readiness_recomputed = match readiness::compute(ctx, &plan.user_id, now).await {
        Ok(result) => result.is_some(),
        Err(e) => {
            tracing::warn!(user = %plan.user_id, error = %e, "Readiness recompute failed after transition");
            false
        }
    };

    tracing::info!(
        task = %task_id,
        from = from.as_str(),
        to = to.as_str(),
        "Task status transition applied"
    );

    Ok(TransitionOutcome {
        task_id: task_id.to_string(),
        from,
        to,
        performance_created,
        performances_deleted,
        readiness_recomputed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{
        Availability, Category, Difficulty, StudyPlan, Task, TaskMeta, TaskType, TimeBand,
        Topic,
    };
    use crate::store::{InMemoryStore, StudyStore};
    use chrono::{Duration, TimeZone, Weekday};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap()
    }

    async fn seeded_ctx() -> EngineCtx {
        let ctx = EngineCtx::new(
            Arc::new(InMemoryStore::new()),
            None,
            Arc::new(AppConfig::default()),
        );
        ctx.store
            .insert_topic(Topic {
                id: "alg".into(),
                name: "Algorithms".into(),
                category: Category::Algorithms,
                difficulty: Difficulty::Medium,
                importance: 5,
                estimated_duration_min: 60,
                prerequisites: vec![],
                created_at: now(),
            })
            .await
            .unwrap();
        ctx.store
            .insert_plan(
                StudyPlan {
                    id: "p1".into(),
                    user_id: "u1".into(),
                    exam_date: now() + Duration::days(14),
                    start_date: now(),
                    end_date: now() + Duration::days(14),
                    is_personalized: true,
                    availability: Availability {
                        weekdays: vec![Weekday::Mon],
                        minutes_per_day: 120,
                        band: TimeBand::Morning,
                    },
                    created_at: now(),
                },
                now(),
            )
            .await
            .unwrap();
        let start = now() + Duration::hours(1);
        ctx.store
            .insert_task(Task {
                id: "t1".into(),
                plan_id: "p1".into(),
                title: "Algorithms · reading".into(),
                description: String::new(),
                task_type: TaskType::Reading,
                status: TaskStatus::Pending,
                start_time: Some(start),
                end_time: Some(start + Duration::minutes(60)),
                duration_min: 60,
                topic_id: "alg".into(),
                difficulty: Difficulty::Medium,
                content_ref: None,
                meta: TaskMeta::default(),
                original_start_time: None,
                original_end_time: None,
                created_at: now(),
            })
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_complete_synthesizes_single_performance() {
        let ctx = seeded_ctx().await;
        let out = apply_status_transition(&ctx, "t1", TaskStatus::Completed, now())
            .await
            .unwrap();
        assert!(out.performance_created.is_some());
        assert!(out.readiness_recomputed);

        let perfs = ctx
            .store
            .performances(&PerformanceFilter::for_user("u1"))
            .await
            .unwrap();
        assert_eq!(perfs.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_revert_complete_leaves_one_performance() {
        let ctx = seeded_ctx().await;
        apply_status_transition(&ctx, "t1", TaskStatus::Completed, now())
            .await
            .unwrap();
        let revert = apply_status_transition(&ctx, "t1", TaskStatus::Pending, now())
            .await
            .unwrap();
        assert_eq!(revert.performances_deleted, 1);

        apply_status_transition(&ctx, "t1", TaskStatus::Completed, now())
            .await
            .unwrap();
        let perfs = ctx
            .store
            .performances(&PerformanceFilter::for_user("u1"))
            .await
            .unwrap();
        assert_eq!(perfs.len(), 1, "idempotent completion must keep one live record");
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let ctx = seeded_ctx().await;
        apply_status_transition(&ctx, "t1", TaskStatus::Skipped, now())
            .await
            .unwrap();
        let err = apply_status_transition(&ctx, "t1", TaskStatus::Completed, now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let ctx = seeded_ctx().await;
        let out = apply_status_transition(&ctx, "t1", TaskStatus::Pending, now())
            .await
            .unwrap();
        assert!(out.performance_created.is_none());
        assert_eq!(out.performances_deleted, 0);
    }
}
