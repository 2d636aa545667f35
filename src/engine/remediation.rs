//! 补救引擎：主题定向干预
//!
//! 为弱项主题加排复习会话，保持「每主题最多一个待办补救复习」的
//! 幂等不变量；另提供效果追踪与一组幂等清理操作（补救去重、
//! 撞时去重、孤儿告警解除、General 告警截断）。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::{
    Adaptation, AdaptationType, Alert, AlertSeverity, AlertType, Priority, RemediationAction,
    StudyPlan, Task, TaskMeta, TaskStatus, TaskType,
};
use crate::error::{EngineError, EngineResult};
use crate::store::{AlertFilter, PerformanceFilter, TaskFilter};

use super::availability::find_next_slot;
use super::EngineCtx;

/// 一次补救排期的结果；created=false 表示命中幂等预检，返回既有任务
#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub task: Task,
    pub alert: Option<Alert>,
    pub created: bool,
}

/// 清理操作计数
#[derive(Debug, Clone, Serialize, Default)]
pub struct CleanupReport {
    pub remediation_duplicates_removed: usize,
    pub collisions_removed: usize,
    pub orphan_alerts_resolved: usize,
    pub general_alerts_trimmed: usize,
}

/// 补救 Agent 单轮运行结果
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRun {
    pub reviews: Vec<RemediationReport>,
    pub cleanup: CleanupReport,
}

/// 为某主题排一次补救复习（对外入口，按计划加锁）
pub async fn schedule_review(
    ctx: &EngineCtx,
    user_id: &str,
    topic_id: &str,
    trigger_alert_id: Option<&str>,
    source: &str,
    now: DateTime<Utc>,
) -> EngineResult<RemediationReport> {
    let plan = ctx
        .store
        .active_plan(user_id, now)
        .await?
        .ok_or_else(|| EngineError::not_found("plan", user_id))?;
    let lock = ctx.store.plan_mutex(&plan.id).await;
    let _guard = lock.lock().await;
    schedule_review_locked(ctx, &plan, topic_id, trigger_alert_id, source, now).await
}

/// 加锁版本：调用方（如自适应引擎）已持有该计划的互斥锁
pub(crate) async fn schedule_review_locked(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    topic_id: &str,
    trigger_alert_id: Option<&str>,
    source: &str,
    now: DateTime<Utc>,
) -> EngineResult<RemediationReport> {
    let topic = ctx
        .store
        .topic(topic_id)
        .await?
        .ok_or_else(|| EngineError::not_found("topic", topic_id))?;

    // 幂等预检：已有待办、未过期的补救复习则原样返回
    let pending = ctx
        .store
        .tasks(&TaskFilter {
            plan_id: Some(plan.id.clone()),
            topic_id: Some(topic_id.to_string()),
            statuses: Some(vec![TaskStatus::Pending]),
            task_type: Some(TaskType::Review),
            remediation_only: true,
            starts_after: Some(now),
            ends_before: None,
        })
        .await?;
    if let Some(existing) = pending.into_iter().next() {
        if let Some(alert_id) = trigger_alert_id {
            point_alert_at_task(ctx, alert_id, &existing.id, now).await?;
        }
        tracing::debug!(topic = %topic_id, task = %existing.id, "Pending remediation review exists, returning it");
        return Ok(RemediationReport {
            task: existing,
            alert: None,
            created: false,
        });
    }

    // 补救具有时效性：用同一套可用性搜索，从现在起取最早槽位
    let all_tasks = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
    let duration = if topic.estimated_duration_min > 0 {
        topic
            .estimated_duration_min
            .min(ctx.cfg.plan.session_max_min)
    } else {
        ctx.cfg.remediation.default_review_min
    };
    let (start, end) = find_next_slot(
        &plan.availability,
        &all_tasks,
        duration,
        now,
        plan.exam_date,
        ctx.cfg.plan.daily_cap_min,
    )
    .ok_or_else(|| {
        EngineError::PlanInfeasible(format!(
            "no open slot for a review of '{}' before the exam",
            topic.name
        ))
    })?;

    let task = Task {
        id: Uuid::new_v4().to_string(),
        plan_id: plan.id.clone(),
        title: format!("{} · review", topic.name),
        description: format!("Remediation review for {}", topic.name),
        task_type: TaskType::Review,
        status: TaskStatus::Pending,
        start_time: Some(start),
        end_time: Some(end),
        duration_min: duration,
        topic_id: topic.id.clone(),
        difficulty: topic.difficulty,
        content_ref: None,
        meta: TaskMeta {
            source: Some(source.to_string()),
            priority: Priority::High,
            is_remediation: true,
            related_alert_id: trigger_alert_id.map(String::from),
        },
        original_start_time: None,
        original_end_time: None,
        created_at: now,
    };
    ctx.store.insert_task(task.clone()).await?;

    let mut alert = Alert {
        id: Uuid::new_v4().to_string(),
        user_id: plan.user_id.clone(),
        plan_id: plan.id.clone(),
        alert_type: AlertType::Remediation,
        severity: AlertSeverity::Medium,
        message: format!(
            "Review session for '{}' scheduled at {}",
            topic.name,
            start.format("%Y-%m-%d %H:%M")
        ),
        related_task_id: Some(task.id.clone()),
        related_topic_id: Some(topic.id.clone()),
        meta: Value::Null,
        is_resolved: false,
        resolved_at: None,
        created_at: now,
    };
    alert.meta_insert("scheduled_task_id", json!(task.id));
    alert.meta_insert("suggested_action", json!("attend_review"));
    ctx.store.insert_alert(alert.clone()).await?;

    if let Some(alert_id) = trigger_alert_id {
        point_alert_at_task(ctx, alert_id, &task.id, now).await?;
    }

    tracing::info!(topic = %topic_id, task = %task.id, "Remediation review scheduled");
    Ok(RemediationReport {
        task,
        alert: Some(alert),
        created: true,
    })
}

/// 把触发告警的 meta 指向已排的补救任务
async fn point_alert_at_task(
    ctx: &EngineCtx,
    alert_id: &str,
    task_id: &str,
    _now: DateTime<Utc>,
) -> EngineResult<()> {
    let Some(mut alert) = ctx.store.alert(alert_id).await? else {
        tracing::debug!(alert = %alert_id, "Trigger alert vanished, nothing to update");
        return Ok(());
    };
    alert.meta_insert("scheduled_task_id", json!(task_id));
    alert.meta_insert("suggested_action", json!("attend_review"));
    ctx.store.update_alert(alert).await
}

/// 效果追踪：把补救动作与当下表现快照关联成审计记录。
/// 只用于评估补救是否有效，不阻断后续动作。
pub async fn record_action(
    ctx: &EngineCtx,
    user_id: &str,
    action: RemediationAction,
    outcome: Value,
    now: DateTime<Utc>,
) -> EngineResult<Adaptation> {
    let plan = ctx
        .store
        .active_plan(user_id, now)
        .await?
        .ok_or_else(|| EngineError::not_found("plan", user_id))?;

    let perfs = ctx
        .store
        .performances(&PerformanceFilter::for_user(user_id))
        .await?;
    let scores: Vec<f64> = perfs.iter().filter_map(|p| p.score).collect();
    let average = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };

    let adaptation = Adaptation {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        plan_id: plan.id,
        adaptation_type: AdaptationType::RemediationOutcome,
        description: format!("remediation action '{}' recorded", action.as_str()),
        reason: "effectiveness tracking".to_string(),
        task_id: None,
        topic_id: None,
        meta: json!({
            "action": action.as_str(),
            "outcome": outcome,
            "average_performance_at_record": average,
        }),
        created_at: now,
    };
    ctx.store.insert_adaptation(adaptation.clone()).await?;
    Ok(adaptation)
}

/// 同主题多个待办补救复习收敛到最早一个，其余删除并把告警改指幸存者
pub async fn dedup_remediation_tasks(
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<usize> {
    let Some(plan) = ctx.store.active_plan(user_id, now).await? else {
        return Ok(0);
    };
    let lock = ctx.store.plan_mutex(&plan.id).await;
    let _guard = lock.lock().await;

    let pending = ctx
        .store
        .tasks(&TaskFilter {
            plan_id: Some(plan.id.clone()),
            statuses: Some(vec![TaskStatus::Pending]),
            task_type: Some(TaskType::Review),
            remediation_only: true,
            ..TaskFilter::default()
        })
        .await?;

    let mut removed = 0usize;
    let mut by_topic: std::collections::HashMap<String, Vec<Task>> = Default::default();
    for task in pending {
        by_topic.entry(task.topic_id.clone()).or_default().push(task);
    }
    for (_, mut group) in by_topic {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|t| (t.start_time, t.created_at, t.id.clone()));
        let survivor = group.remove(0);
        for doomed in group {
            ctx.store.delete_task(&doomed.id).await?;
            removed += 1;
            repoint_alerts(ctx, user_id, &doomed.id, &survivor.id).await?;
        }
    }
    Ok(removed)
}

/// 同计划同主题同起始时间的撞时任务收敛到最早创建的一个；
/// 引用被删任务的告警直接解除。
pub async fn dedup_colliding_tasks(
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<usize> {
    let Some(plan) = ctx.store.active_plan(user_id, now).await? else {
        return Ok(0);
    };
    let lock = ctx.store.plan_mutex(&plan.id).await;
    let _guard = lock.lock().await;

    let tasks = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
    let mut groups: std::collections::HashMap<(String, Option<DateTime<Utc>>), Vec<Task>> =
        Default::default();
    for task in tasks {
        if task.start_time.is_none() {
            continue;
        }
        groups
            .entry((task.topic_id.clone(), task.start_time))
            .or_default()
            .push(task);
    }

    let mut removed = 0usize;
    for (_, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|t| (t.created_at, t.id.clone()));
        for doomed in group.into_iter().skip(1) {
            ctx.store.delete_task(&doomed.id).await?;
            removed += 1;
            resolve_alerts_for_task(ctx, user_id, &doomed.id, now).await?;
        }
    }
    Ok(removed)
}

/// 目标任务已不存在的未解除告警一律解除
pub async fn resolve_orphan_alerts(
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<usize> {
    let alerts = ctx
        .store
        .alerts(&AlertFilter {
            user_id: Some(user_id.to_string()),
            unresolved_only: true,
            ..AlertFilter::default()
        })
        .await?;

    let mut resolved = 0usize;
    for mut alert in alerts {
        let Some(task_id) = alert.related_task_id.clone() else {
            continue;
        };
        if ctx.store.task(&task_id).await?.is_none() {
            alert.resolve(now);
            ctx.store.update_alert(alert).await?;
            resolved += 1;
        }
    }
    Ok(resolved)
}

/// General 告警只保留每用户最近 N 条，更早的删除
pub async fn cap_general_alerts(
    ctx: &EngineCtx,
    user_id: &str,
    _now: DateTime<Utc>,
) -> EngineResult<usize> {
    let mut alerts = ctx
        .store
        .alerts(&AlertFilter {
            user_id: Some(user_id.to_string()),
            alert_type: Some(AlertType::General),
            ..AlertFilter::default()
        })
        .await?;
    let cap = ctx.cfg.remediation.general_alert_cap;
    if alerts.len() <= cap {
        return Ok(0);
    }
    // alerts 按 created_at 升序返回，砍掉最早的多余部分
    alerts.sort_by_key(|a| (a.created_at, a.id.clone()));
    let excess = alerts.len() - cap;
    let mut trimmed = 0usize;
    for alert in alerts.into_iter().take(excess) {
        if ctx.store.delete_alert(&alert.id).await? {
            trimmed += 1;
        }
    }
    Ok(trimmed)
}

/// 全量清理（幂等，可按需或周期运行）
pub async fn run_cleanup(
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<CleanupReport> {
    let report = CleanupReport {
        remediation_duplicates_removed: dedup_remediation_tasks(ctx, user_id, now).await?,
        collisions_removed: dedup_colliding_tasks(ctx, user_id, now).await?,
        orphan_alerts_resolved: resolve_orphan_alerts(ctx, user_id, now).await?,
        general_alerts_trimmed: cap_general_alerts(ctx, user_id, now).await?,
    };
    tracing::info!(
        user = %user_id,
        dup = report.remediation_duplicates_removed,
        collisions = report.collisions_removed,
        orphans = report.orphan_alerts_resolved,
        trimmed = report.general_alerts_trimmed,
        "Cleanup pass finished"
    );
    Ok(report)
}

/// 补救 Agent：显式指定主题则只排该主题；否则按最新就绪度的
/// 弱项类别逐主题补排，最后统一跑一轮清理。
pub async fn run(
    ctx: &EngineCtx,
    user_id: &str,
    topic_id: Option<&str>,
    trigger_alert_id: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<RemediationRun> {
    let mut reviews = Vec::new();

    match topic_id {
        Some(topic) => {
            reviews
                .push(schedule_review(ctx, user_id, topic, trigger_alert_id, "remediation", now).await?);
        }
        None => {
            let weak_cats = ctx
                .store
                .latest_readiness(user_id)
                .await?
                .map(|r| r.weak_areas)
                .unwrap_or_default();
            if !weak_cats.is_empty() {
                let topics = ctx.store.topics().await?;
                for topic in topics.iter().filter(|t| weak_cats.contains(&t.category)) {
                    match schedule_review(ctx, user_id, &topic.id, None, "remediation", now).await
                    {
                        Ok(report) => reviews.push(report),
                        Err(EngineError::PlanInfeasible(msg)) => {
                            tracing::warn!(topic = %topic.id, %msg, "No slot for remediation review, skipping");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    let cleanup = run_cleanup(ctx, user_id, now).await?;
    Ok(RemediationRun { reviews, cleanup })
}

async fn repoint_alerts(
    ctx: &EngineCtx,
    user_id: &str,
    removed_task_id: &str,
    survivor_task_id: &str,
) -> EngineResult<()> {
    let alerts = ctx
        .store
        .alerts(&AlertFilter {
            user_id: Some(user_id.to_string()),
            related_task_id: Some(removed_task_id.to_string()),
            ..AlertFilter::default()
        })
        .await?;
    for mut alert in alerts {
        alert.related_task_id = Some(survivor_task_id.to_string());
        alert.meta_insert("scheduled_task_id", json!(survivor_task_id));
        ctx.store.update_alert(alert).await?;
    }
    Ok(())
}

async fn resolve_alerts_for_task(
    ctx: &EngineCtx,
    user_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let alerts = ctx
        .store
        .alerts(&AlertFilter {
            user_id: Some(user_id.to_string()),
            related_task_id: Some(task_id.to_string()),
            unresolved_only: true,
            ..AlertFilter::default()
        })
        .await?;
    for mut alert in alerts {
        alert.resolve(now);
        ctx.store.update_alert(alert).await?;
    }
    Ok(())
}
