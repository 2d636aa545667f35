//! 领域模型：主题图、学习计划与任务、练习成绩与就绪度、告警与调整审计、调度条目

pub mod alert;
pub mod performance;
pub mod schedule;
pub mod task;
pub mod topic;

pub use alert::{Adaptation, AdaptationType, Alert, AlertSeverity, AlertType, RemediationAction};
pub use performance::{AnswerRecord, Performance, ReadinessScore};
pub use schedule::{AgentKind, ScheduleEntry, ScheduleKind, SequenceKind};
pub use task::{
    Availability, Priority, StudyPlan, Task, TaskMeta, TaskStatus, TaskType, TimeBand,
};
pub use topic::{Category, Difficulty, Topic, TopicGraph};

pub type UserId = String;
pub type PlanId = String;
pub type TaskId = String;
pub type TopicId = String;
