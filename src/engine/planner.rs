//! 学习计划排期器
//!
//! 可用时间 × 主题重要度（弱项加权）→ 按日铺排的任务序列。
//! 主题按前置拓扑序展开，弱项与高重要度主题前置；校验报告只是
//! 建议性的，不阻塞落库。可用时间为空或考试日期已过直接失败，
//! 不产生任何任务。

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    Availability, StudyPlan, Task, TaskMeta, TaskStatus, TaskType, Topic, TopicId,
};
use crate::error::{EngineError, EngineResult};

use super::availability::{available_days, band_start, total_available_minutes};
use super::EngineCtx;
use crate::domain::TopicGraph;

/// 排期请求；runAgent(scheduler) 的 params 直接反序列化为该结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub user_id: String,
    pub availability: Availability,
    pub exam_date: DateTime<Utc>,
    /// 诊断出的弱项主题，分配时间时加权前置
    #[serde(default)]
    pub weak_topics: Vec<TopicId>,
    #[serde(default = "default_personalized")]
    pub personalized: bool,
}

fn default_personalized() -> bool {
    true
}

/// 建议性校验告警，不阻塞计划落库
#[derive(Debug, Clone, Serialize)]
pub enum PlanWarning {
    /// 单日排期超过日容量上限
    DayOverloaded { date: NaiveDate, minutes: i64 },
    /// 窗口太小，主题一个任务都没排上
    TopicUncovered { topic_id: TopicId },
}

/// 排期结果：已落库的计划与任务 + 校验报告
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan: StudyPlan,
    pub tasks: Vec<Task>,
    pub warnings: Vec<PlanWarning>,
}

/// 每个主题的待排会话（类型按序轮换）
struct SessionSlot<'a> {
    topic: &'a Topic,
    session_index: usize,
    duration_min: i64,
}

const SESSION_ROTATION: [TaskType; 4] = [
    TaskType::Reading,
    TaskType::Video,
    TaskType::Practice,
    TaskType::Quiz,
];

/// 构建并持久化一份学习计划
pub async fn build_plan(
    ctx: &EngineCtx,
    req: &PlanRequest,
    now: DateTime<Utc>,
) -> EngineResult<PlanReport> {
    if req.availability.is_empty() {
        return Err(EngineError::PlanInfeasible(
            "availability has no usable days".to_string(),
        ));
    }
    if req.exam_date <= now {
        return Err(EngineError::PlanInfeasible(
            "exam date is in the past".to_string(),
        ));
    }

    let topics = ctx.store.topics().await?;
    if topics.is_empty() {
        return Err(EngineError::PlanInfeasible("no topics to schedule".to_string()));
    }
    let graph = TopicGraph::new(topics)?;

    let days = available_days(&req.availability, now, req.exam_date);
    if days.is_empty() {
        return Err(EngineError::PlanInfeasible(
            "no available days before the exam".to_string(),
        ));
    }
    let total_minutes = total_available_minutes(&req.availability, now, req.exam_date);

    // 弱项与高重要度主题排在拓扑序允许的最前面
    let is_weak = |t: &Topic| req.weak_topics.contains(&t.id);
    let ordered = graph.ordered_by(|t| {
        let weak_bonus = if is_weak(t) { 1000 } else { 0 };
        weak_bonus + t.importance as i64 * 10
    });

    // 时间按重要度成比例分配，弱项乘以 weak_boost
    let weight = |t: &Topic| {
        let boost = if is_weak(t) { ctx.cfg.plan.weak_boost } else { 1.0 };
        t.importance.max(1) as f64 * boost
    };
    let total_weight: f64 = ordered.iter().map(|&t| weight(t)).sum();


    let mut sessions: Vec<Vec<SessionSlot<'_>>> = Vec::with_capacity(ordered.len());
    for &topic in &ordered {
        let alloc = total_minutes as f64 * weight(topic) / total_weight;
        let session_len = topic
            .estimated_duration_min
            .clamp(1, ctx.cfg.plan.session_max_min)
            .min(req.availability.minutes_per_day);
        let count = ((alloc / session_len as f64).round() as usize).max(1);
        sessions.push(
            (0..count)
                .map(|i| SessionSlot {
                    topic,
                    session_index: i,
                    duration_min: session_len,
                })
                .collect(),
        );
    }

    // 第一轮：每个主题先排一个会话（保证前置主题先于依赖方出现在日历上）；
    // 之后按同一顺序轮转填充剩余会话。
    let mut queue: Vec<SessionSlot<'_>> = Vec::new();
    let mut rest: Vec<Vec<SessionSlot<'_>>> = Vec::new();
    for mut topic_sessions in sessions {
        if !topic_sessions.is_empty() {
            queue.push(topic_sessions.remove(0));
        }
        rest.push(topic_sessions);
    }
    loop {
        let mut pushed = false;
        for topic_sessions in rest.iter_mut() {
            if !topic_sessions.is_empty() {
                queue.push(topic_sessions.remove(0));
                pushed = true;
            }
        }
        if !pushed {
            break;
        }
    }

    // 逐日顺排：游标越过已用分钟，放不下就推进到下一个可用日
    let plan_id = Uuid::new_v4().to_string();
    let mut tasks: Vec<Task> = Vec::new();
    let mut day_idx = 0usize;
    let mut day_used: i64 = 0;
    for slot in queue {
        let mut placed = false;
        while day_idx < days.len() {
            let date = days[day_idx];
            let start = band_start(date, req.availability.band) + Duration::minutes(day_used);
            let end = start + Duration::minutes(slot.duration_min);
            let fits_capacity =
                day_used + slot.duration_min <= req.availability.minutes_per_day;
            if fits_capacity && start >= now && end <= req.exam_date {
                tasks.push(build_task(&plan_id, &slot, start, end, now));
                day_used += slot.duration_min;
                placed = true;
                break;
            }
            day_idx += 1;
            day_used = 0;
        }
        if !placed {
            break; // 剩余会话排不下，交给校验报告提示覆盖缺口
        }
    }

    let plan = StudyPlan {
        id: plan_id,
        user_id: req.user_id.clone(),
        exam_date: req.exam_date,
        start_date: now,
        end_date: req.exam_date,
        is_personalized: req.personalized,
        availability: req.availability.clone(),
        created_at: now,
    };

    ctx.store.insert_plan(plan.clone(), now).await?;
    for task in &tasks {
        ctx.store.insert_task(task.clone()).await?;
    }

    let warnings = validate(&ordered, &tasks, ctx.cfg.plan.daily_cap_min);
    tracing::info!(
        user = %req.user_id,
        tasks = tasks.len(),
        warnings = warnings.len(),
        "Study plan built"
    );

    Ok(PlanReport {
        plan,
        tasks,
        warnings,
    })
}

fn build_task(
    plan_id: &str,
    slot: &SessionSlot<'_>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Task {
    let task_type = SESSION_ROTATION[slot.session_index % SESSION_ROTATION.len()];
    Task {
        id: Uuid::new_v4().to_string(),
        plan_id: plan_id.to_string(),
        title: format!("{} · {}", slot.topic.name, task_type.as_str()),
        description: format!(
            "Session {} for {} ({})",
            slot.session_index + 1,
            slot.topic.name,
            slot.topic.category
        ),
        task_type,
        status: TaskStatus::Pending,
        start_time: Some(start),
        end_time: Some(end),
        duration_min: slot.duration_min,
        topic_id: slot.topic.id.clone(),
        difficulty: slot.topic.difficulty,
        content_ref: None,
        meta: TaskMeta {
            source: Some("planner".to_string()),
            ..TaskMeta::default()
        },
        original_start_time: None,
        original_end_time: None,
        created_at: now,
    }
}

/// 校验（建议性）：日过载与主题覆盖缺口
fn validate(ordered: &[&Topic], tasks: &[Task], daily_cap_min: i64) -> Vec<PlanWarning> {
    let mut warnings = Vec::new();

    let mut per_day: std::collections::BTreeMap<NaiveDate, i64> = Default::default();
    for task in tasks {
        if let Some(start) = task.start_time {
            *per_day.entry(start.date_naive()).or_default() += task.duration_min;
        }
    }
    for (date, minutes) in per_day {
        if minutes > daily_cap_min {
            warnings.push(PlanWarning::DayOverloaded { date, minutes });
        }
    }

    for topic in ordered {
        if !tasks.iter().any(|t| t.topic_id == topic.id) {
            warnings.push(PlanWarning::TopicUncovered {
                topic_id: topic.id.clone(),
            });
        }
    }
    warnings
}

/// 从 JSON params 解析排期请求（编排器使用）
pub fn parse_request(user_id: &str, params: &Value) -> EngineResult<PlanRequest> {
    let mut value = params.clone();
    if value.is_object() && value.get("user_id").is_none() {
        if let Some(map) = value.as_object_mut() {
            map.insert("user_id".to_string(), Value::String(user_id.to_string()));
        }
    }
    serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidParams(format!("plan request: {e}")))
}
