//! 自适应引擎
//!
//! 消费监控结果（缺省时内部重算），按固定顺序应用四条独立策略：
//! 改期 → 难度调整 → 补排复习 → 负载再均衡。后面的策略假定日历
//! 已反映前面的改动，因此整轮持有计划互斥锁。每次任务变更都落一条
//! Adaptation 审计记录。

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{
    Adaptation, AdaptationType, Category, Difficulty, StudyPlan, Task, TaskStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::store::{PerformanceFilter, TaskFilter};

use super::availability::{available_days, find_next_slot, find_slot_on_day, minutes_scheduled_on};
use super::monitor::MonitorReport;
use super::{monitor, remediation, EngineCtx};

/// 一轮自适应的结果
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationReport {
    pub adaptations: Vec<Adaptation>,
    pub summary: String,
    pub llm_suggestions: Option<String>,
    pub enrichment_failed: bool,
}

/// 执行一轮自适应。monitor_report 缺省时内部跑一次监控。
pub async fn run(
    ctx: &EngineCtx,
    user_id: &str,
    monitor_report: Option<&MonitorReport>,
    now: DateTime<Utc>,
) -> EngineResult<AdaptationReport> {
    let plan = ctx
        .store
        .active_plan(user_id, now)
        .await?
        .ok_or_else(|| EngineError::not_found("plan", user_id))?;

    let owned_report;
    let report = match monitor_report {
        Some(r) => r,
        None => {
            owned_report = monitor::run(ctx, user_id, None, now).await?;
            &owned_report
        }
    };

    // 整轮持锁：后面的策略要看到前面策略改过的日历
    let lock = ctx.store.plan_mutex(&plan.id).await;
    let _guard = lock.lock().await;

    let mut adaptations = Vec::new();
    reschedule_missed(ctx, &plan, &mut adaptations, now).await?;
    adjust_difficulty(ctx, &plan, &mut adaptations, now).await?;
    add_review_sessions(ctx, &plan, report, &mut adaptations, now).await?;
    rebalance_workload(ctx, &plan, &mut adaptations, now).await?;

    drop(_guard);

    let summary = summarize(&adaptations);

    let mut llm_suggestions = None;
    let mut enrichment_failed = false;
    if let Some(summarizer) = &ctx.summarizer {
        match summarizer.suggest_adaptations(&adaptations).await {
            Ok(text) => llm_suggestions = Some(text),
            Err(e) => {
                enrichment_failed = true;
                tracing::warn!(user = %user_id, error = %e, "Adaptation enrichment failed, continuing");
            }
        }
    }

    tracing::info!(user = %user_id, count = adaptations.len(), "Adaptation run finished");
    Ok(AdaptationReport {
        adaptations,
        summary,
        llm_suggestions,
        enrichment_failed,
    })
}

/// 策略一：漏掉的任务改期到下一个符合可用性的空闲槽位
async fn reschedule_missed(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    adaptations: &mut Vec<Adaptation>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let tasks = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
    let missed: Vec<Task> = tasks
        .iter()
        .filter(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                && t.end_time.map(|e| e < now).unwrap_or(false)
        })
        .cloned()
        .collect();

    for mut task in missed {
        // 槽位搜索要基于当前日历（含本轮已改期的任务）
        let current = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
        let others: Vec<Task> = current.into_iter().filter(|t| t.id != task.id).collect();
        let Some((start, end)) = find_next_slot(
            &plan.availability,
            &others,
            task.duration_min,
            now,
            plan.exam_date,
            ctx.cfg.plan.daily_cap_min,
        ) else {
            tracing::warn!(task = %task.id, "No slot left to reschedule missed task");
            continue;
        };

        let old_start = task.start_time;
        task.capture_original_times();
        task.start_time = Some(start);
        task.end_time = Some(end);
        task.status = TaskStatus::Pending;
        ctx.store.update_task(task.clone()).await?;

        adaptations.push(
            record(
                ctx,
                plan,
                AdaptationType::RescheduleTask,
                format!(
                    "moved '{}' to {}",
                    task.title,
                    start.format("%Y-%m-%d %H:%M")
                ),
                "task deadline was missed".to_string(),
                Some(task.id.clone()),
                Some(task.topic_id.clone()),
                json!({ "from": old_start, "to": start }),
                now,
            )
            .await?,
        );
    }
    Ok(())
}

/// 策略二：按主题最近成绩做滞回式难度升降（连续 N 个样本越界才动，
/// 单样本不触发，避免来回震荡）
async fn adjust_difficulty(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    adaptations: &mut Vec<Adaptation>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let cfg = &ctx.cfg.adaptation;
    let perfs = ctx
        .store
        .performances(&PerformanceFilter::for_user(&plan.user_id))
        .await?;

    let mut by_topic: std::collections::HashMap<String, Vec<f64>> = Default::default();
    for perf in &perfs {
        if let Some(score) = perf.score {
            by_topic.entry(perf.topic_id.clone()).or_default().push(score);
        }
    }

    for (topic_id, scores) in by_topic {
        if scores.len() < cfg.hysteresis_window {
            continue;
        }
        let recent = &scores[scores.len() - cfg.hysteresis_window..];
        let direction = if recent.iter().all(|s| *s < cfg.lower_below) {
            Some(false)
        } else if recent.iter().all(|s| *s > cfg.raise_above) {
            Some(true)
        } else {
            None
        };
        let Some(raise) = direction else { continue };

        let pending = ctx
            .store
            .tasks(&TaskFilter {
                plan_id: Some(plan.id.clone()),
                topic_id: Some(topic_id.clone()),
                statuses: Some(vec![TaskStatus::Pending]),
                ..TaskFilter::default()
            })
            .await?;

        let mut changed: Vec<(String, Difficulty, Difficulty)> = Vec::new();
        for mut task in pending {
            let next = if raise {
                task.difficulty.raised()
            } else {
                task.difficulty.lowered()
            };
            if next != task.difficulty {
                let old = task.difficulty;
                task.difficulty = next;
                ctx.store.update_task(task.clone()).await?;
                changed.push((task.id.clone(), old, next));
            }
        }
        if changed.is_empty() {
            continue;
        }

        adaptations.push(
            record(
                ctx,
                plan,
                AdaptationType::AdjustDifficulty,
                format!(
                    "{} difficulty for {} pending task(s) on topic '{}'",
                    if raise { "raised" } else { "lowered" },
                    changed.len(),
                    topic_id
                ),
                format!(
                    "last {} graded scores were persistently {}",
                    cfg.hysteresis_window,
                    if raise { "high" } else { "low" }
                ),
                None,
                Some(topic_id),
                json!({ "raise": raise, "tasks": changed.iter().map(|c| &c.0).collect::<Vec<_>>() }),
                now,
            )
            .await?,
        );
    }
    Ok(())
}

/// 策略三：弱项类别下缺少待办复习的主题，委托补救引擎补排
/// （槽位选择与去重策略见补救引擎）
async fn add_review_sessions(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    report: &MonitorReport,
    adaptations: &mut Vec<Adaptation>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let weak_cats: Vec<Category> = match &report.readiness {
        Some(r) => r.weak_areas.clone(),
        None => match ctx.store.latest_readiness(&plan.user_id).await? {
            Some(r) => r.weak_areas,
            None => return Ok(()),
        },
    };
    if weak_cats.is_empty() {
        return Ok(());
    }

    let topics = ctx.store.topics().await?;
    for topic in topics.iter().filter(|t| weak_cats.contains(&t.category)) {
        match remediation::schedule_review_locked(ctx, plan, &topic.id, None, "adaptation", now)
            .await
        {
            Ok(result) if result.created => {
                adaptations.push(
                    record(
                        ctx,
                        plan,
                        AdaptationType::AddReviewSession,
                        format!("added review session for weak topic '{}'", topic.name),
                        format!("category {} is below the readiness threshold", topic.category),
                        Some(result.task.id.clone()),
                        Some(topic.id.clone()),
                        json!({ "scheduled_for": result.task.start_time }),
                        now,
                    )
                    .await?,
                );
            }
            Ok(_) => {} // 已有待办复习，幂等命中
            Err(EngineError::PlanInfeasible(msg)) => {
                tracing::warn!(topic = %topic.id, %msg, "No slot for review session, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// 策略四：超过日容量的天，把低优先级任务挪到最近的未满可用日
async fn rebalance_workload(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    adaptations: &mut Vec<Adaptation>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let cap = ctx.cfg.plan.daily_cap_min;
    let days = available_days(&plan.availability, now, plan.exam_date);

    loop {
        let tasks = ctx.store.tasks(&TaskFilter::for_plan(&plan.id)).await?;
        // 只统计未来的待办负载；过去的日子无从再均衡
        let pending: Vec<&Task> = tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.start_time.map(|s| s >= now).unwrap_or(false)
            })
            .collect();

        let mut per_day: std::collections::BTreeMap<NaiveDate, i64> = Default::default();
        for task in &pending {
            if let Some(start) = task.start_time {
                *per_day.entry(start.date_naive()).or_default() += task.duration_min;
            }
        }
        let Some((&overloaded_day, _)) = per_day.iter().find(|(_, m)| **m > cap) else {
            break; // 没有过载日，收敛
        };

        // 低优先级且靠后的先挪
        let mut candidates: Vec<Task> = pending
            .iter()
            .filter(|t| t.start_time.map(|s| s.date_naive()) == Some(overloaded_day))
            .map(|t| (*t).clone())
            .collect();
        candidates.sort_by_key(|t| (t.meta.priority, std::cmp::Reverse(t.start_time)));
        let Some(mut task) = candidates.into_iter().next() else {
            break;
        };

        // 距离过载日最近的未满可用日
        let mut target_slot = None;
        let mut best_distance = i64::MAX;
        for &date in &days {
            if date == overloaded_day {
                continue;
            }
            let load = minutes_scheduled_on(&tasks, date);
            if load + task.duration_min > cap {
                continue;
            }
            let others: Vec<Task> =
                tasks.iter().filter(|t| t.id != task.id).cloned().collect();
            if let Some(slot) = find_slot_on_day(
                date,
                &plan.availability,
                &others,
                task.duration_min,
                now,
                plan.exam_date,
                cap,
            ) {
                let distance = (date.num_days_from_ce() - overloaded_day.num_days_from_ce()).abs() as i64;
                if distance < best_distance {
                    best_distance = distance;
                    target_slot = Some(slot);
                }
            }
        }
        let Some((start, end)) = target_slot else {
            tracing::warn!(day = %overloaded_day, "Overloaded day but no under-capacity day available");
            break;
        };

        let old_start = task.start_time;
        task.capture_original_times();
        task.start_time = Some(start);
        task.end_time = Some(end);
        ctx.store.update_task(task.clone()).await?;

        adaptations.push(
            record(
                ctx,
                plan,
                AdaptationType::RebalanceWorkload,
                format!(
                    "moved '{}' from {} to {}",
                    task.title,
                    overloaded_day,
                    start.date_naive()
                ),
                format!("day {} exceeded the {} minute cap", overloaded_day, cap),
                Some(task.id.clone()),
                Some(task.topic_id.clone()),
                json!({ "from": old_start, "to": start }),
                now,
            )
            .await?,
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn record(
    ctx: &EngineCtx,
    plan: &StudyPlan,
    adaptation_type: AdaptationType,
    description: String,
    reason: String,
    task_id: Option<String>,
    topic_id: Option<String>,
    meta: serde_json::Value,
    now: DateTime<Utc>,
) -> EngineResult<Adaptation> {
    let adaptation = Adaptation {
        id: Uuid::new_v4().to_string(),
        user_id: plan.user_id.clone(),
        plan_id: plan.id.clone(),
        adaptation_type,
        description,
        reason,
        task_id,
        topic_id,
        meta,
        created_at: now,
    };
    ctx.store.insert_adaptation(adaptation.clone()).await?;
    Ok(adaptation)
}

fn summarize(adaptations: &[Adaptation]) -> String {
    if adaptations.is_empty() {
        return "no adaptations needed".to_string();
    }
    let count_of = |ty: AdaptationType| {
        adaptations
            .iter()
            .filter(|a| a.adaptation_type == ty)
            .count()
    };
    format!(
        "{} adaptation(s): {} rescheduled, {} difficulty adjustments, {} review sessions, {} rebalanced",
        adaptations.len(),
        count_of(AdaptationType::RescheduleTask),
        count_of(AdaptationType::AdjustDifficulty),
        count_of(AdaptationType::AddReviewSession),
        count_of(AdaptationType::RebalanceWorkload),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{
        Availability, Performance, Priority, StudyPlan, TaskMeta, TaskType, TimeBand, Topic,
    };
    use crate::store::{InMemoryStore, StudyStore};
    use chrono::{Duration, TimeZone, Weekday};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        // 周一早上
        Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap()
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
                difficulty: Difficulty::Hard,
                importance: 8,
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
                    start_date: now() - Duration::days(7),
                    end_date: now() + Duration::days(14),
                    is_personalized: true,
                    availability: Availability {
                        weekdays: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
                        minutes_per_day: 240,
                        band: TimeBand::Morning,
                    },
                    created_at: now() - Duration::days(7),
                },
                now(),
            )
            .await
            .unwrap();
        ctx
    }

    fn task(id: &str, start: DateTime<Utc>, dur: i64, priority: Priority) -> Task {
        Task {
            id: id.to_string(),
            plan_id: "p1".into(),
            title: format!("task {id}"),
            description: String::new(),
            task_type: TaskType::Practice,
            status: TaskStatus::Pending,
            start_time: Some(start),
            end_time: Some(start + Duration::minutes(dur)),
            duration_min: dur,
            topic_id: "alg".into(),
            difficulty: Difficulty::Hard,
            content_ref: None,
            meta: TaskMeta {
                source: Some("planner".into()),
                priority,
                is_remediation: false,
                related_alert_id: None,
            },
            original_start_time: None,
            original_end_time: None,
            created_at: now() - Duration::days(7),
        }
    }

    fn graded(id: &str, score: f64) -> Performance {
        Performance {
            id: id.to_string(),
            user_id: "u1".into(),
            task_id: id.to_string(),
            topic_id: "alg".into(),
            content_ref: None,
            score: Some(score),
            time_spent_min: 30,
            completed: true,
            confidence: 4,
            answers: vec![],
            created_at: now() - Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_missed_task_is_rescheduled_with_original_times_kept() {
        let ctx = seeded_ctx().await;
        let old_start = now() - Duration::days(3);
        ctx.store
            .insert_task(task("missed", old_start, 60, Priority::Medium))
            .await
            .unwrap();

        let report = run(&ctx, "u1", None, now()).await.unwrap();
        assert!(report
            .adaptations
            .iter()
            .any(|a| a.adaptation_type == AdaptationType::RescheduleTask));

        let moved = ctx.store.task("missed").await.unwrap().unwrap();
        assert!(moved.start_time.unwrap() >= now());
        assert_eq!(moved.original_start_time, Some(old_start));
        assert_eq!(moved.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_difficulty_lowered_only_after_persistent_lows() {
        let ctx = seeded_ctx().await;
        ctx.store
            .insert_task(task("future", now() + Duration::days(1), 60, Priority::Medium))
            .await
            .unwrap();

        // 两个低分样本：未达滞回窗口，不动
        ctx.store.insert_performance(graded("g1", 30.0)).await.unwrap();
        ctx.store.insert_performance(graded("g2", 35.0)).await.unwrap();
        run(&ctx, "u1", None, now()).await.unwrap();
        assert_eq!(
            ctx.store.task("future").await.unwrap().unwrap().difficulty,
            Difficulty::Hard
        );

        // 第三个低分样本触发降档
        ctx.store.insert_performance(graded("g3", 28.0)).await.unwrap();
        let report = run(&ctx, "u1", None, now()).await.unwrap();
        assert!(report
            .adaptations
            .iter()
            .any(|a| a.adaptation_type == AdaptationType::AdjustDifficulty));
        assert_eq!(
            ctx.store.task("future").await.unwrap().unwrap().difficulty,
            Difficulty::Medium
        );
    }

    #[tokio::test]
    async fn test_overloaded_day_sheds_lowest_priority_task() {
        let ctx = seeded_ctx().await;
        // 周一 240 分钟容量被 300 分钟挤爆（校验在 insert 时只查重叠，不查容量）
        let monday = Utc.with_ymd_and_hms(2025, 3, 17, 8, 0, 0).unwrap();
        ctx.store
            .insert_task(task("keep-1", monday, 120, Priority::High))
            .await
            .unwrap();
        ctx.store
            .insert_task(task("keep-2", monday + Duration::minutes(120), 120, Priority::High))
            .await
            .unwrap();
        ctx.store
            .insert_task(task(
                "shed",
                monday + Duration::minutes(240),
                60,
                Priority::Low,
            ))
            .await
            .unwrap();

        let report = run(&ctx, "u1", None, now()).await.unwrap();
        assert!(report
            .adaptations
            .iter()
            .any(|a| a.adaptation_type == AdaptationType::RebalanceWorkload));

        let moved = ctx.store.task("shed").await.unwrap().unwrap();
        assert_ne!(
            moved.start_time.unwrap().date_naive(),
            monday.date_naive(),
            "lowest-priority task must leave the overloaded day"
        );
    }
}
