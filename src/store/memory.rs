//! 内存存储后端
//!
//! RwLock 包裹的 HashMap 集合，读多写少；plan_locks 按计划懒创建互斥锁。
//! claim_due 在写锁内完成「筛选 + 打标」，等价于单条 CAS。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::domain::{
    Adaptation, Alert, Performance, ReadinessScore, ScheduleEntry, StudyPlan, Task, Topic,
    UserId,
};
use crate::error::{EngineError, EngineResult};

use super::{
    validate_plan_insert, validate_task_write, AlertFilter, PerformanceFilter, ScheduleStore,
    StudyStore, TaskFilter,
};

/// 进程内存储；Clone 共享同一份底层数据
#[derive(Default)]
pub struct InMemoryStore {
    topics: RwLock<HashMap<String, Topic>>,
    plans: RwLock<HashMap<String, StudyPlan>>,
    tasks: RwLock<HashMap<String, Task>>,
    performances: RwLock<HashMap<String, Performance>>,
    readiness: RwLock<Vec<ReadinessScore>>,
    alerts: RwLock<HashMap<String, Alert>>,
    adaptations: RwLock<Vec<Adaptation>>,
    schedules: RwLock<HashMap<String, ScheduleEntry>>,
    plan_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：绕过写入校验直接落库，模拟外部写入者留下的
    /// 脏数据（清理操作针对的正是这类历史库存）
    #[cfg(test)]
    pub(crate) async fn insert_task_unchecked(&self, task: Task) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }
}

#[async_trait]
impl StudyStore for InMemoryStore {
    async fn insert_topic(&self, topic: Topic) -> EngineResult<()> {
        self.topics.write().await.insert(topic.id.clone(), topic);
        Ok(())
    }

    async fn topic(&self, id: &str) -> EngineResult<Option<Topic>> {
        Ok(self.topics.read().await.get(id).cloned())
    }

    async fn topics(&self) -> EngineResult<Vec<Topic>> {
        Ok(self.topics.read().await.values().cloned().collect())
    }

    async fn insert_plan(&self, plan: StudyPlan, now: DateTime<Utc>) -> EngineResult<()> {
        let mut plans = self.plans.write().await;
        let existing: Vec<StudyPlan> = plans.values().cloned().collect();
        validate_plan_insert(&plan, &existing, now)?;
        plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn plan(&self, id: &str) -> EngineResult<Option<StudyPlan>> {
        Ok(self.plans.read().await.get(id).cloned())
    }

    async fn active_plan(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<StudyPlan>> {
        let plans = self.plans.read().await;
        let mut candidates: Vec<&StudyPlan> = plans
            .values()
            .filter(|p| p.user_id == user_id && p.is_active(now))
            .collect();
        candidates.sort_by_key(|p| p.created_at);
        Ok(candidates.last().map(|p| (*p).clone()))
    }

    async fn user_ids(&self) -> EngineResult<Vec<UserId>> {
        let plans = self.plans.read().await;
        let mut users: Vec<UserId> = plans.values().map(|p| p.user_id.clone()).collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn insert_task(&self, task: Task) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        let siblings: Vec<Task> = tasks
            .values()
            .filter(|t| t.plan_id == task.plan_id)
            .cloned()
            .collect();
        validate_task_write(&task, &siblings)?;
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn update_task(&self, task: Task) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(EngineError::not_found("task", &task.id));
        }
        let siblings: Vec<Task> = tasks
            .values()
            .filter(|t| t.plan_id == task.plan_id)
            .cloned()
            .collect();
        validate_task_write(&task, &siblings)?;
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn task(&self, id: &str) -> EngineResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.start_time, t.created_at, t.id.clone()));
        Ok(out)
    }

    async fn delete_task(&self, id: &str) -> EngineResult<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    async fn insert_performance(&self, perf: Performance) -> EngineResult<()> {
        self.performances
            .write()
            .await
            .insert(perf.id.clone(), perf);
        Ok(())
    }

    async fn performances(
        &self,
        filter: &PerformanceFilter,
    ) -> EngineResult<Vec<Performance>> {
        let perfs = self.performances.read().await;
        let mut out: Vec<Performance> = perfs
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.created_at, p.id.clone()));
        Ok(out)
    }

    async fn delete_performances_for_task(&self, task_id: &str) -> EngineResult<usize> {
        let mut perfs = self.performances.write().await;
        let ids: Vec<String> = perfs
            .values()
            .filter(|p| p.task_id == task_id)
            .map(|p| p.id.clone())
            .collect();
        for id in &ids {
            perfs.remove(id);
        }
        Ok(ids.len())
    }

    async fn insert_readiness(&self, score: ReadinessScore) -> EngineResult<()> {
        self.readiness.write().await.push(score);
        Ok(())
    }

    async fn latest_readiness(&self, user_id: &str) -> EngineResult<Option<ReadinessScore>> {
        let scores = self.readiness.read().await;
        Ok(scores
            .iter()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn insert_alert(&self, alert: Alert) -> EngineResult<()> {
        self.alerts.write().await.insert(alert.id.clone(), alert);
        Ok(())
    }

    async fn update_alert(&self, alert: Alert) -> EngineResult<()> {
        let mut alerts = self.alerts.write().await;
        if !alerts.contains_key(&alert.id) {
            return Err(EngineError::not_found("alert", &alert.id));
        }
        alerts.insert(alert.id.clone(), alert);
        Ok(())
    }

    async fn alert(&self, id: &str) -> EngineResult<Option<Alert>> {
        Ok(self.alerts.read().await.get(id).cloned())
    }

    async fn alerts(&self, filter: &AlertFilter) -> EngineResult<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut out: Vec<Alert> = alerts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.created_at, a.id.clone()));
        Ok(out)
    }

    async fn delete_alert(&self, id: &str) -> EngineResult<bool> {
        Ok(self.alerts.write().await.remove(id).is_some())
    }

    async fn insert_adaptation(&self, adaptation: Adaptation) -> EngineResult<()> {
        self.adaptations.write().await.push(adaptation);
        Ok(())
    }

    async fn adaptations(&self, user_id: &str) -> EngineResult<Vec<Adaptation>> {
        let all = self.adaptations.read().await;
        Ok(all
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn plan_mutex(&self, plan_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.plan_locks.lock().await;
        locks
            .entry(plan_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn insert_entry(&self, entry: ScheduleEntry) -> EngineResult<()> {
        self.schedules.write().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn update_entry(&self, entry: ScheduleEntry) -> EngineResult<()> {
        let mut schedules = self.schedules.write().await;
        if !schedules.contains_key(&entry.id) {
            return Err(EngineError::not_found("schedule entry", &entry.id));
        }
        schedules.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> EngineResult<bool> {
        Ok(self.schedules.write().await.remove(id).is_some())
    }

    async fn entry(&self, id: &str) -> EngineResult<Option<ScheduleEntry>> {
        Ok(self.schedules.read().await.get(id).cloned())
    }

    async fn entries(&self) -> EngineResult<Vec<ScheduleEntry>> {
        let schedules = self.schedules.read().await;
        let mut out: Vec<ScheduleEntry> = schedules.values().cloned().collect();
        out.sort_by_key(|e| (e.next_run, e.id.clone()));
        Ok(out)
    }

    async fn entries_for_user(&self, user_id: &str) -> EngineResult<Vec<ScheduleEntry>> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .values()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> EngineResult<Vec<ScheduleEntry>> {
        // 写锁内完成筛选与打标，重叠扫描不会拿到同一条目
        let mut schedules = self.schedules.write().await;
        let mut claimed = Vec::new();
        for entry in schedules.values_mut() {
            if !entry.is_due(now) {
                continue;
            }
            if let Some(at) = entry.claimed_at {
                if now - at < stale_after {
                    continue; // 在途认领未过期，跳过
                }
            }
            entry.claimed_at = Some(now);
            claimed.push(entry.clone());
        }
        claimed.sort_by_key(|e| (std::cmp::Reverse(e.priority), e.next_run));
        Ok(claimed)
    }

    async fn finish_entry(
        &self,
        id: &str,
        now: DateTime<Utc>,
        outcome: &str,
        next_run: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> EngineResult<()> {
        let mut schedules = self.schedules.write().await;
        let entry = schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("schedule entry", id))?;
        entry.claimed_at = None;
        entry.last_run = Some(now);
        entry.last_outcome = Some(outcome.to_string());
        if let Some(next) = next_run {
            entry.next_run = next;
        }
        entry.enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Availability, TaskMeta, TaskStatus, TaskType, TimeBand};
    use crate::domain::{Category, Difficulty};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap()
    }

    fn plan(id: &str, user: &str) -> StudyPlan {
        StudyPlan {
            id: id.to_string(),
            user_id: user.to_string(),
            exam_date: now() + Duration::days(14),
            start_date: now(),
            end_date: now() + Duration::days(14),
            is_personalized: true,
            availability: Availability {
                weekdays: vec![chrono::Weekday::Mon],
                minutes_per_day: 120,
                band: TimeBand::Morning,
            },
            created_at: now(),
        }
    }

    fn task(id: &str, plan_id: &str, start_h: u32, dur: i64) -> Task {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, start_h, 0, 0).unwrap();
        Task {
            id: id.to_string(),
            plan_id: plan_id.to_string(),
            title: String::new(),
            description: String::new(),
            task_type: TaskType::Reading,
            status: TaskStatus::Pending,
            start_time: Some(start),
            end_time: Some(start + Duration::minutes(dur)),
            duration_min: dur,
            topic_id: "t1".to_string(),
            difficulty: Difficulty::Medium,
            content_ref: None,
            meta: TaskMeta::default(),
            original_start_time: None,
            original_end_time: None,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn test_single_active_plan_per_user() {
        let store = InMemoryStore::new();
        store.insert_plan(plan("p1", "u1"), now()).await.unwrap();
        let err = store.insert_plan(plan("p2", "u1"), now()).await.unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
        // 其他用户不受影响
        store.insert_plan(plan("p3", "u2"), now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_tasks_rejected() {
        let store = InMemoryStore::new();
        store.insert_plan(plan("p1", "u1"), now()).await.unwrap();
        store.insert_task(task("a", "p1", 8, 60)).await.unwrap();
        let err = store.insert_task(task("b", "p1", 8, 30)).await.unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
        // 相邻区间合法
        store.insert_task(task("c", "p1", 9, 60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_due_is_exclusive() {
        let store = InMemoryStore::new();
        let entry = ScheduleEntry::standard_monitoring("u1".into(), 60, now());
        let id = entry.id.clone();
        store.insert_entry(entry).await.unwrap();

        let first = store.claim_due(now(), Duration::minutes(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        // 重叠的第二次扫描拿不到同一条目
        let second = store.claim_due(now(), Duration::minutes(10)).await.unwrap();
        assert!(second.is_empty());
        // 过期认领可回收
        let third = store
            .claim_due(now() + Duration::minutes(11), Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id, id);
    }

    #[tokio::test]
    async fn test_topic_category_is_preserved() {
        let store = InMemoryStore::new();
        store
            .insert_topic(crate::domain::Topic {
                id: "t1".into(),
                name: "Graphs".into(),
                category: Category::Algorithms,
                difficulty: Difficulty::Hard,
                importance: 8,
                estimated_duration_min: 90,
                prerequisites: vec![],
                created_at: now(),
            })
            .await
            .unwrap();
        let got = store.topic("t1").await.unwrap().unwrap();
        assert_eq!(got.category, Category::Algorithms);
    }
}
