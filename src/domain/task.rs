//! 学习计划与任务
//!
//! StudyPlan 是单个用户备考的聚合根，随计划保存每周可用时段，
//! 供自适应引擎按同样的可用性规则改期。Task 状态机的合法迁移集中在
//! TaskStatus::can_transition，迁移副作用见 engine::transition。

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

use super::topic::Difficulty;
use super::{PlanId, TaskId, TopicId, UserId};

/// 每日偏好时段；决定当天首个任务的起始小时
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBand {
    Morning,
    Afternoon,
    Evening,
}

impl TimeBand {
    /// 时段起始小时（UTC）
    pub fn start_hour(self) -> u32 {
        match self {
            TimeBand::Morning => 8,
            TimeBand::Afternoon => 13,
            TimeBand::Evening => 18,
        }
    }
}

/// 每周可用时间：星期集合 + 每日分钟数 + 偏好时段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Availability {
    pub weekdays: Vec<Weekday>,
    pub minutes_per_day: i64,
    pub band: TimeBand,
}

impl Availability {
    pub fn includes(&self, day: Weekday) -> bool {
        self.weekdays.contains(&day)
    }

    /// 无可用日或每日 0 分钟视为空
    pub fn is_empty(&self) -> bool {
        self.weekdays.is_empty() || self.minutes_per_day <= 0
    }
}

/// 学习计划聚合根。不变量：同一用户最多一个未过期计划（由存储层在插入时校验）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyPlan {
    pub id: PlanId,
    pub user_id: UserId,
    pub exam_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    /// 由 exam_date 派生
    pub end_date: DateTime<Utc>,
    pub is_personalized: bool,
    pub availability: Availability,
    pub created_at: DateTime<Utc>,
}

impl StudyPlan {
    /// 计划尚未过期（end_date 未过）
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.end_date >= now
    }
}

/// 任务类型；Quiz / Practice 为计分类型，其余完成即可
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Video,
    Quiz,
    Reading,
    Practice,
    Review,
}

impl TaskType {
    pub fn is_graded(self) -> bool {
        matches!(self, TaskType::Quiz | TaskType::Practice)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Video => "video",
            TaskType::Quiz => "quiz",
            TaskType::Reading => "reading",
            TaskType::Practice => "practice",
            TaskType::Review => "review",
        }
    }
}

/// 任务状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl TaskStatus {
    /// 合法迁移：Pending→InProgress→Completed、Pending→Skipped，
    /// 以及 Completed/Skipped→Pending 的回退。
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (Pending, Completed)
                | (Completed, Pending)
                | (Skipped, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// 任务优先级（负载再均衡时低优先级先被挪走）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// 任务元数据袋：来源 Agent、优先级、补救标记、关联告警
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskMeta {
    /// 写入该任务的来源（planner / adaptation / remediation）
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub is_remediation: bool,
    pub related_alert_id: Option<String>,
}

/// 计划内的一个可排期学习单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub plan_id: PlanId,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 分钟；两端时间都存在时必须等于 end - start
    pub duration_min: i64,
    pub topic_id: TopicId,
    pub difficulty: Difficulty,
    pub content_ref: Option<String>,
    #[serde(default)]
    pub meta: TaskMeta,
    /// 首次改期时各捕获一次，用于回退到调整前的日历
    pub original_start_time: Option<DateTime<Utc>>,
    pub original_end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn is_scheduled(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_some()
    }

    /// 半开区间 [start, end) 是否与另一任务相交；未排期的任务不参与
    pub fn overlaps(&self, other: &Task) -> bool {
        match (self.start_time, self.end_time, other.start_time, other.end_time) {
            (Some(s1), Some(e1), Some(s2), Some(e2)) => s1 < e2 && s2 < e1,
            _ => false,
        }
    }

    /// 时间不变量：end > start；两端齐备时 duration 必须与区间一致
    pub fn validate_times(&self) -> EngineResult<()> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(EngineError::DataIntegrity(format!(
                    "task '{}': end_time must be after start_time",
                    self.id
                )));
            }
            let span = (end - start).num_minutes();
            if span != self.duration_min {
                return Err(EngineError::DataIntegrity(format!(
                    "task '{}': duration {}min diverges from time range {}min",
                    self.id, self.duration_min, span
                )));
            }
        }
        Ok(())
    }

    /// 首次改期时捕获原始时间（此后保持不变）
    pub fn capture_original_times(&mut self) {
        if self.original_start_time.is_none() {
            self.original_start_time = self.start_time;
            self.original_end_time = self.end_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduled(id: &str, start_h: u32, dur: i64) -> Task {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, start_h, 0, 0).unwrap();
        Task {
            id: id.to_string(),
            plan_id: "p1".to_string(),
            title: String::new(),
            description: String::new(),
            task_type: TaskType::Reading,
            status: TaskStatus::Pending,
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::minutes(dur)),
            duration_min: dur,
            topic_id: "t1".to_string(),
            difficulty: Difficulty::Medium,
            content_ref: None,
            meta: TaskMeta::default(),
            original_start_time: None,
            original_end_time: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_transition_rules() {
        use TaskStatus::*;
        assert!(Pending.can_transition(InProgress));
        assert!(InProgress.can_transition(Completed));
        assert!(Pending.can_transition(Skipped));
        assert!(Completed.can_transition(Pending));
        assert!(Skipped.can_transition(Pending));
        assert!(!Completed.can_transition(Skipped));
        assert!(!Skipped.can_transition(Completed));
        assert!(!InProgress.can_transition(Skipped));
    }

    #[test]
    fn test_overlap_is_half_open() {
        let a = scheduled("a", 8, 60);
        let b = scheduled("b", 9, 60); // 紧邻，[8,9) 与 [9,10) 不相交
        let c = scheduled("c", 8, 90);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_duration_must_match_range() {
        let mut t = scheduled("a", 8, 60);
        assert!(t.validate_times().is_ok());
        t.duration_min = 45;
        assert!(matches!(
            t.validate_times(),
            Err(EngineError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_original_times_captured_once() {
        let mut t = scheduled("a", 8, 60);
        let first_start = t.start_time;
        t.capture_original_times();
        t.start_time = t.start_time.map(|s| s + chrono::Duration::hours(2));
        t.end_time = t.end_time.map(|e| e + chrono::Duration::hours(2));
        t.capture_original_times();
        assert_eq!(t.original_start_time, first_start);
    }
}
