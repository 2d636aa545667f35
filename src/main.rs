//! Owl - Rust 备考计划智能体系统
//!
//! 演示入口：建内存（或 SQLite）存储、播种示例主题、为演示用户
//! 构建学习计划，然后跑一条 comprehensive 序列并打印聚合结果，
//! 最后演示调度条目的扇出与到期处理。

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc, Weekday};

use owl::config::load_config;
use owl::domain::{Availability, Category, Difficulty, TaskStatus, TimeBand, Topic};
use owl::engine::planner::PlanRequest;
use owl::engine::{transition, EngineCtx};
use owl::llm::create_summarizer_from_config;
use owl::orchestrator::{AgentOutput, Orchestrator, RunOptions, SequenceSpec};
use owl::sched::AgentScheduler;
use owl::store::{InMemoryStore, ScheduleStore, SqliteStore, StudyStore};
use owl::domain::{AgentKind, SequenceKind};

const DEMO_USER: &str = "demo-user";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    owl::observability::init();

    let cfg = Arc::new(load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        owl::config::AppConfig::default()
    }));

    // 存储：配置了 db_path 用 SQLite，否则内存
    let (study_store, schedule_store): (Arc<dyn StudyStore>, Arc<dyn ScheduleStore>) =
        match &cfg.app.db_path {
            Some(path) => {
                let store = Arc::new(
                    SqliteStore::open(path).context("Failed to open SQLite store")?,
                );
                tracing::info!(path = %path.display(), "Using SQLite store");
                (store.clone(), store)
            }
            None => {
                let store = Arc::new(InMemoryStore::new());
                tracing::info!("Using in-memory store");
                (store.clone(), store)
            }
        };

    let now = Utc::now();
    seed_topics(study_store.as_ref(), now).await?;

    let summarizer = create_summarizer_from_config(&cfg);
    let ctx = EngineCtx::new(study_store, Some(summarizer), cfg);
    let orchestrator = Arc::new(Orchestrator::new(ctx));

    // 1. 构建学习计划（agentType = scheduler）
    let plan_request = PlanRequest {
        user_id: DEMO_USER.to_string(),
        availability: Availability {
            weekdays: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
            minutes_per_day: 120,
            band: TimeBand::Evening,
        },
        exam_date: now + Duration::days(30),
        weak_topics: vec!["graphs".to_string()],
        personalized: true,
    };
    let step = orchestrator
        .run_agent(
            AgentKind::Scheduler,
            DEMO_USER,
            serde_json::to_value(&plan_request)?,
            RunOptions::default(),
            now,
        )
        .await
        .context("Plan build failed")?;

    if let Some(AgentOutput::Plan(report)) = &step.output {
        println!(
            "Plan built: {} tasks, {} warning(s)",
            report.tasks.len(),
            report.warnings.len()
        );
        // 演示状态迁移的显式副作用：完成第一个任务
        if let Some(first) = report.tasks.first() {
            let outcome = transition::apply_status_transition(
                orchestrator.ctx(),
                &first.id,
                TaskStatus::Completed,
                now,
            )
            .await?;
            println!(
                "Completed '{}' (performance created: {})",
                first.title,
                outcome.performance_created.is_some()
            );
        }
    }

    // 2. 跑一条 comprehensive 序列：Monitor → Adaptation → Remediation
    let report = orchestrator
        .run_sequence(
            SequenceSpec::Named(SequenceKind::Comprehensive),
            DEMO_USER,
            RunOptions {
                bypass_rate_limit: true,
            },
            now,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    // 3. 调度器：扇出标准监控并处理到期条目
    let scheduler = AgentScheduler::new(schedule_store, orchestrator.clone());
    let fanned_out = scheduler.ensure_monitoring(now).await?;
    let sweep = scheduler.process_due(now).await?;
    println!(
        "Scheduler: {} entr(ies) fanned out, sweep claimed={} succeeded={} failed={}",
        fanned_out, sweep.claimed, sweep.succeeded, sweep.failed
    );

    Ok(())
}

/// 示例主题：两条前置链 + 独立主题
async fn seed_topics(store: &dyn StudyStore, now: chrono::DateTime<Utc>) -> anyhow::Result<()> {
    let topics = [
        ("arrays", "Arrays & Strings", Category::DataStructures, Difficulty::Easy, 7, vec![]),
        ("graphs", "Graph Algorithms", Category::Algorithms, Difficulty::Hard, 9, vec!["arrays"]),
        ("dp", "Dynamic Programming", Category::Algorithms, Difficulty::Hard, 8, vec!["arrays"]),
        ("sql", "SQL & Query Planning", Category::Databases, Difficulty::Medium, 6, vec![]),
        ("tcp", "Transport Protocols", Category::Networking, Difficulty::Medium, 5, vec![]),
        ("authn", "Authentication", Category::Security, Difficulty::Medium, 6, vec!["tcp"]),
    ];
    for (id, name, category, difficulty, importance, prereqs) in topics {
        store
            .insert_topic(Topic {
                id: id.to_string(),
                name: name.to_string(),
                category,
                difficulty,
                importance,
                estimated_duration_min: 60,
                prerequisites: prereqs.into_iter().map(String::from).collect(),
                created_at: now,
            })
            .await?;
    }
    Ok(())
}
