//! 监控引擎
//!
//! 对比计划与实际完成情况，算统计、触发就绪度重算、按规则产告警。
//! 三条规则相互独立、每次运行都评估；创建前对同用户同类型的
//! 未解除告警去重，避免告警风暴。自然语言摘要是可选增强，
//! 失败不影响规则产出。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    Alert, AlertSeverity, AlertType, ReadinessScore, StudyPlan, TaskStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::store::{AlertFilter, PerformanceFilter, TaskFilter};

use super::{readiness, EngineCtx};

/// 计划执行统计
#[derive(Debug, Clone, Serialize, Default)]
pub struct PlanStats {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Pending / InProgress 且 end_time 已过
    pub missed_tasks: usize,
    pub missed_ratio: f64,
    /// 有分数的成绩均值；无计分数据时为 None
    pub average_performance: Option<f64>,
}

/// 监控结果：统计 + 新建告警 + 就绪度 + 可选摘要
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub stats: PlanStats,
    pub alerts: Vec<Alert>,
    pub readiness: Option<ReadinessScore>,
    pub insights: Option<String>,
    /// 增强被调用且失败（规则产出不受影响）
    pub enrichment_failed: bool,
}

/// 执行一轮监控；precomputed 可传入已算好的就绪度避免重复计算
pub async fn run(
    ctx: &EngineCtx,
    user_id: &str,
    precomputed: Option<ReadinessScore>,
    now: DateTime<Utc>,
) -> EngineResult<MonitorReport> {
    let plan = ctx
        .store
        .active_plan(user_id, now)
        .await?
        .ok_or_else(|| EngineError::not_found("plan", user_id))?;

    let tasks = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let missed = tasks
        .iter()
        .filter(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                && t.end_time.map(|e| e < now).unwrap_or(false)
        })
        .count();
    let missed_ratio = if tasks.is_empty() {
        0.0
    } else {
        missed as f64 / tasks.len() as f64
    };

    let perfs = ctx
        .store
        .performances(&PerformanceFilter::for_user(user_id))
        .await?;
    let scores: Vec<f64> = perfs.iter().filter_map(|p| p.score).collect();
    let average_performance = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };

    let stats = PlanStats {
        total_tasks: tasks.len(),
        completed_tasks: completed,
        missed_tasks: missed,
        missed_ratio,
        average_performance,
    };

    let readiness = match precomputed {
        Some(score) => Some(score),
        None => readiness::compute(ctx, user_id, now).await?,
    };

    let alerts = raise_alerts(ctx, &plan, &stats, readiness.as_ref(), now).await?;

    // 可选增强：失败只降级，规则告警仍然完整返回
    let mut insights = None;
    let mut enrichment_failed = false;
    if let Some(summarizer) = &ctx.summarizer {
        match summarizer.summarize_monitor(&stats, &alerts).await {
            Ok(text) => insights = Some(text),
            Err(e) => {
                enrichment_failed = true;
                tracing::warn!(user = %user_id, error = %e, "Monitor enrichment failed, continuing without insights");
            }
        }
    }

    tracing::info!(
        user = %user_id,
        total = stats.total_tasks,
        missed = stats.missed_tasks,
        new_alerts = alerts.len(),
        "Monitor run finished"
    );

    Ok(MonitorReport {
        stats,
        alerts,
        readiness,
        insights,
        enrichment_failed,
    })
}

/// 规则集：漏学比例、平均成绩、总体就绪度。相互独立，逐条评估。
async fn raise_alerts(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    stats: &PlanStats,
    readiness: Option<&ReadinessScore>,
    now: DateTime<Utc>,
) -> EngineResult<Vec<Alert>> {
    let cfg = &ctx.cfg.monitor;
    let mut created = Vec::new();

    if stats.total_tasks > 0 && stats.missed_ratio >= cfg.missed_ratio_alert {
        let severity = if stats.missed_ratio >= cfg.missed_ratio_high {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };
        let message = format!(
            "{} of {} tasks were missed ({:.0}%); consider rescheduling",
            stats.missed_tasks,
            stats.total_tasks,
            stats.missed_ratio * 100.0
        );
        if let Some(alert) =
            create_deduped(ctx, plan, AlertType::MissedTask, severity, message, now).await?
        {
            created.push(alert);
        }
    }

    if let Some(avg) = stats.average_performance {
        if avg < cfg.low_performance_alert {
            let severity = if avg < cfg.low_performance_high {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            };
            let message = format!("average performance {avg:.1}% is below target");
            if let Some(alert) =
                create_deduped(ctx, plan, AlertType::LowPerformance, severity, message, now)
                    .await?
            {
                created.push(alert);
            }
        }
    }

    if let Some(score) = readiness {
        if score.overall_score < cfg.readiness_alert {
            let message = format!(
                "overall readiness {:.1}% is below the target of {:.0}%",
                score.overall_score, cfg.readiness_alert
            );
            if let Some(alert) = create_deduped(
                ctx,
                plan,
                AlertType::General,
                AlertSeverity::Medium,
                message,
                now,
            )
            .await?
            {
                created.push(alert);
            }
        }
    }

    Ok(created)
}

/// 同用户同类型已有未解除告警时跳过创建
async fn create_deduped(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    alert_type: AlertType,
    severity: AlertSeverity,
    message: String,
    now: DateTime<Utc>,
) -> EngineResult<Option<Alert>> {
    let existing = ctx
        .store
        .alerts(&AlertFilter::unresolved(&plan.user_id, alert_type))
        .await?;
    if !existing.is_empty() {
        tracing::debug!(
            user = %plan.user_id,
            alert_type = alert_type.as_str(),
            "Unresolved alert of same type exists, skipping"
        );
        return Ok(None);
    }

    let alert = Alert {
        id: Uuid::new_v4().to_string(),
        user_id: plan.user_id.clone(),
        plan_id: plan.id.clone(),
        alert_type,
        severity,
        message,
        related_task_id: None,
        related_topic_id: None,
        meta: Value::Null,
        is_resolved: false,
        resolved_at: None,
        created_at: now,
    };
    ctx.store.insert_alert(alert.clone()).await?;
    Ok(Some(alert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{
        Availability, Category, Difficulty, Task, TaskMeta, TaskType, TimeBand, Topic,
    };
    use crate::store::{InMemoryStore, StudyStore};
    use chrono::{Duration, TimeZone, Weekday};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap()
    }

    fn ctx() -> EngineCtx {
        EngineCtx::new(
            Arc::new(InMemoryStore::new()),
            None,
            Arc::new(AppConfig::default()),
        )
    }

    async fn seed_plan_with_tasks(ctx: &EngineCtx, total: usize, missed: usize) {
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
                    exam_date: now() + Duration::days(7),
                    start_date: now() - Duration::days(7),
                    end_date: now() + Duration::days(7),
                    is_personalized: true,
                    availability: Availability {
                        weekdays: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
                        minutes_per_day: 120,
                        band: TimeBand::Morning,
                    },
                    created_at: now() - Duration::days(7),
                },
                now(),
            )
            .await
            .unwrap();

        for i in 0..total {
            // 前 missed 个排在过去且保持 Pending，其余排在未来
            let start = if i < missed {
                now() - Duration::days(3) + Duration::minutes(i as i64 * 60)
            } else {
                now() + Duration::days(1) + Duration::minutes(i as i64 * 60)
            };
            ctx.store
                .insert_task(Task {
                    id: format!("t{i}"),
                    plan_id: "p1".into(),
                    title: format!("task {i}"),
                    description: String::new(),
                    task_type: TaskType::Reading,
                    status: TaskStatus::Pending,
                    start_time: Some(start),
                    end_time: Some(start + Duration::minutes(45)),
                    duration_min: 45,
                    topic_id: "alg".into(),
                    difficulty: Difficulty::Medium,
                    content_ref: None,
                    meta: TaskMeta::default(),
                    original_start_time: None,
                    original_end_time: None,
                    created_at: now() - Duration::days(7),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_thirty_percent_missed_raises_single_high_alert() {
        let ctx = ctx();
        seed_plan_with_tasks(&ctx, 10, 3).await;

        let report = run(&ctx, "u1", None, now()).await.unwrap();
        assert_eq!(report.stats.total_tasks, 10);
        assert_eq!(report.stats.missed_tasks, 3);

        let missed: Vec<&Alert> = report
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::MissedTask)
            .collect();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].severity, AlertSeverity::High);
        assert!(report
            .alerts
            .iter()
            .all(|a| a.alert_type != AlertType::LowPerformance));
    }

    #[tokio::test]
    async fn test_alerts_deduped_across_runs() {
        let ctx = ctx();
        seed_plan_with_tasks(&ctx, 10, 3).await;

        let first = run(&ctx, "u1", None, now()).await.unwrap();
        assert_eq!(first.alerts.len(), 1);
        let second = run(&ctx, "u1", None, now()).await.unwrap();
        assert!(second.alerts.is_empty(), "unresolved alert must suppress duplicates");

        let all = ctx
            .store
            .alerts(&AlertFilter::unresolved("u1", AlertType::MissedTask))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_plan_is_not_found() {
        let ctx = ctx();
        let err = run(&ctx, "ghost", None, now()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_low_performance_rule_fires_independently() {
        let ctx = ctx();
        seed_plan_with_tasks(&ctx, 10, 0).await;
        ctx.store
            .insert_performance(crate::domain::Performance {
                id: "pf1".into(),
                user_id: "u1".into(),
                task_id: "t9".into(),
                topic_id: "alg".into(),
                content_ref: None,
                score: Some(42.0),
                time_spent_min: 45,
                completed: true,
                confidence: 4,
                answers: vec![],
                created_at: now(),
            })
            .await
            .unwrap();

        let report = run(&ctx, "u1", None, now()).await.unwrap();
        let low: Vec<&Alert> = report
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::LowPerformance)
            .collect();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].severity, AlertSeverity::High);
        // 42 分也把就绪度拉到阈值之下 → General 告警同样触发
        assert!(report
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::General));
    }
}
