//! 练习成绩与就绪度评分

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::topic::Category;
use super::{TaskId, TopicId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub selected: String,
    pub correct: bool,
}

/// 单次任务完成的成绩记录；除「回退删除」外只追加不修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub id: String,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub topic_id: TopicId,
    pub content_ref: Option<String>,
    /// 0-100；非计分任务为 None
    pub score: Option<f64>,
    pub time_spent_min: i64,
    pub completed: bool,
    /// 自评信心 1-5，作为类别均值的权重
    pub confidence: u8,
    #[serde(default)]
    pub answers: Vec<AnswerRecord>,
    pub created_at: DateTime<Utc>,
}

/// 就绪度快照：每次触发整体重算并追加新记录，按 created_at 取最新为准
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessScore {
    pub id: String,
    pub user_id: UserId,
    pub overall_score: f64,
    pub category_scores: BTreeMap<Category, f64>,
    pub weak_areas: Vec<Category>,
    pub strong_areas: Vec<Category>,
    pub projected_score: f64,
    pub created_at: DateTime<Utc>,
}
