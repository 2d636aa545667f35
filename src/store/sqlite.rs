//! SQLite 存储后端
//!
//! 单连接 + tokio Mutex 串行访问；记录本体以 JSON 存入 payload 列，
//! 仅为查询键建列。过滤谓词与内存后端共用同一套 matches 实现，
//! 两个后端行为保持一致。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::domain::{
    Adaptation, Alert, Performance, ReadinessScore, ScheduleEntry, StudyPlan, Task, Topic,
    UserId,
};
use crate::error::{EngineError, EngineResult};

use super::{
    validate_plan_insert, validate_task_write, AlertFilter, PerformanceFilter, ScheduleStore,
    StudyStore, TaskFilter,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS topics (
    id      TEXT PRIMARY KEY,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS plans (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id      TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS performances (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS readiness (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS alerts (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS adaptations (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schedule_entries (
    id      TEXT PRIMARY KEY,
    user_id TEXT,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_plan ON tasks (plan_id);
CREATE INDEX IF NOT EXISTS idx_perf_user ON performances (user_id);
CREATE INDEX IF NOT EXISTS idx_alerts_user ON alerts (user_id);
";

/// SQLite 后端；连接被 Mutex 串行化，单条语句即单文档原子写
pub struct SqliteStore {
    conn: Mutex<Connection>,
    plan_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            plan_locks: Mutex::new(HashMap::new()),
        })
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            plan_locks: Mutex::new(HashMap::new()),
        })
    }

    fn encode<T: Serialize>(value: &T) -> EngineResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(payload: &str) -> EngineResult<T> {
        Ok(serde_json::from_str(payload)?)
    }

    fn load_all<T: DeserializeOwned>(conn: &Connection, table: &str) -> EngineResult<Vec<T>> {
        let mut stmt = conn.prepare(&format!("SELECT payload FROM {table}"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::decode(&row?)?);
        }
        Ok(out)
    }

    fn load_by<T: DeserializeOwned>(
        conn: &Connection,
        table: &str,
        column: &str,
        key: &str,
    ) -> EngineResult<Vec<T>> {
        let mut stmt =
            conn.prepare(&format!("SELECT payload FROM {table} WHERE {column} = ?1"))?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::decode(&row?)?);
        }
        Ok(out)
    }

    fn load_one<T: DeserializeOwned>(
        conn: &Connection,
        table: &str,
        id: &str,
    ) -> EngineResult<Option<T>> {
        let mut stmt = conn.prepare(&format!("SELECT payload FROM {table} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(Self::decode(&row?)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StudyStore for SqliteStore {
    async fn insert_topic(&self, topic: Topic) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO topics (id, payload) VALUES (?1, ?2)",
            params![topic.id, Self::encode(&topic)?],
        )?;
        Ok(())
    }

    async fn topic(&self, id: &str) -> EngineResult<Option<Topic>> {
        let conn = self.conn.lock().await;
        Self::load_one(&conn, "topics", id)
    }

    async fn topics(&self) -> EngineResult<Vec<Topic>> {
        let conn = self.conn.lock().await;
        Self::load_all(&conn, "topics")
    }

    async fn insert_plan(&self, plan: StudyPlan, now: DateTime<Utc>) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let existing: Vec<StudyPlan> = Self::load_all(&conn, "plans")?;
        validate_plan_insert(&plan, &existing, now)?;
        conn.execute(
            "INSERT INTO plans (id, user_id, payload) VALUES (?1, ?2, ?3)",
            params![plan.id, plan.user_id, Self::encode(&plan)?],
        )?;
        Ok(())
    }

    async fn plan(&self, id: &str) -> EngineResult<Option<StudyPlan>> {
        let conn = self.conn.lock().await;
        Self::load_one(&conn, "plans", id)
    }

    async fn active_plan(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<StudyPlan>> {
        let conn = self.conn.lock().await;
        let mut plans: Vec<StudyPlan> = Self::load_by(&conn, "plans", "user_id", user_id)?;
        plans.retain(|p| p.is_active(now));
        plans.sort_by_key(|p| p.created_at);
        Ok(plans.pop())
    }

    async fn user_ids(&self) -> EngineResult<Vec<UserId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM plans ORDER BY user_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn insert_task(&self, task: Task) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let siblings: Vec<Task> = Self::load_by(&conn, "tasks", "plan_id", &task.plan_id)?;
        validate_task_write(&task, &siblings)?;
        conn.execute(
            "INSERT INTO tasks (id, plan_id, payload) VALUES (?1, ?2, ?3)",
            params![task.id, task.plan_id, Self::encode(&task)?],
        )?;
        Ok(())
    }

    async fn update_task(&self, task: Task) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        if Self::load_one::<Task>(&conn, "tasks", &task.id)?.is_none() {
            return Err(EngineError::not_found("task", &task.id));
        }
        let siblings: Vec<Task> = Self::load_by(&conn, "tasks", "plan_id", &task.plan_id)?;
        validate_task_write(&task, &siblings)?;
        conn.execute(
            "UPDATE tasks SET plan_id = ?2, payload = ?3 WHERE id = ?1",
            params![task.id, task.plan_id, Self::encode(&task)?],
        )?;
        Ok(())
    }

    async fn task(&self, id: &str) -> EngineResult<Option<Task>> {
        let conn = self.conn.lock().await;
        Self::load_one(&conn, "tasks", id)
    }

    async fn tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let candidates: Vec<Task> = match &filter.plan_id {
            Some(plan) => Self::load_by(&conn, "tasks", "plan_id", plan)?,
            None => Self::load_all(&conn, "tasks")?,
        };
        let mut out: Vec<Task> = candidates.into_iter().filter(|t| filter.matches(t)).collect();
        out.sort_by_key(|t| (t.start_time, t.created_at, t.id.clone()));
        Ok(out)
    }

    async fn delete_task(&self, id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    async fn insert_performance(&self, perf: Performance) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO performances (id, user_id, task_id, payload) VALUES (?1, ?2, ?3, ?4)",
            params![perf.id, perf.user_id, perf.task_id, Self::encode(&perf)?],
        )?;
        Ok(())
    }

    async fn performances(
        &self,
        filter: &PerformanceFilter,
    ) -> EngineResult<Vec<Performance>> {
        let conn = self.conn.lock().await;
        let candidates: Vec<Performance> = match &filter.user_id {
            Some(user) => Self::load_by(&conn, "performances", "user_id", user)?,
            None => Self::load_all(&conn, "performances")?,
        };
        let mut out: Vec<Performance> =
            candidates.into_iter().filter(|p| filter.matches(p)).collect();
        out.sort_by_key(|p| (p.created_at, p.id.clone()));
        Ok(out)
    }

    async fn delete_performances_for_task(&self, task_id: &str) -> EngineResult<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM performances WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(n)
    }

    async fn insert_readiness(&self, score: ReadinessScore) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO readiness (id, user_id, payload) VALUES (?1, ?2, ?3)",
            params![score.id, score.user_id, Self::encode(&score)?],
        )?;
        Ok(())
    }

    async fn latest_readiness(&self, user_id: &str) -> EngineResult<Option<ReadinessScore>> {
        let conn = self.conn.lock().await;
        let mut scores: Vec<ReadinessScore> =
            Self::load_by(&conn, "readiness", "user_id", user_id)?;
        scores.sort_by_key(|s| s.created_at);
        Ok(scores.pop())
    }

    async fn insert_alert(&self, alert: Alert) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO alerts (id, user_id, payload) VALUES (?1, ?2, ?3)",
            params![alert.id, alert.user_id, Self::encode(&alert)?],
        )?;
        Ok(())
    }

    async fn update_alert(&self, alert: Alert) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE alerts SET user_id = ?2, payload = ?3 WHERE id = ?1",
            params![alert.id, alert.user_id, Self::encode(&alert)?],
        )?;
        if n == 0 {
            return Err(EngineError::not_found("alert", &alert.id));
        }
        Ok(())
    }

    async fn alert(&self, id: &str) -> EngineResult<Option<Alert>> {
        let conn = self.conn.lock().await;
        Self::load_one(&conn, "alerts", id)
    }

    async fn alerts(&self, filter: &AlertFilter) -> EngineResult<Vec<Alert>> {
        let conn = self.conn.lock().await;
        let candidates: Vec<Alert> = match &filter.user_id {
            Some(user) => Self::load_by(&conn, "alerts", "user_id", user)?,
            None => Self::load_all(&conn, "alerts")?,
        };
        let mut out: Vec<Alert> = candidates.into_iter().filter(|a| filter.matches(a)).collect();
        out.sort_by_key(|a| (a.created_at, a.id.clone()));
        Ok(out)
    }

    async fn delete_alert(&self, id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM alerts WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    async fn insert_adaptation(&self, adaptation: Adaptation) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO adaptations (id, user_id, payload) VALUES (?1, ?2, ?3)",
            params![adaptation.id, adaptation.user_id, Self::encode(&adaptation)?],
        )?;
        Ok(())
    }

    async fn adaptations(&self, user_id: &str) -> EngineResult<Vec<Adaptation>> {
        let conn = self.conn.lock().await;
        let mut out: Vec<Adaptation> = Self::load_by(&conn, "adaptations", "user_id", user_id)?;
        out.sort_by_key(|a| (a.created_at, a.id.clone()));
        Ok(out)
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
impl ScheduleStore for SqliteStore {
    async fn insert_entry(&self, entry: ScheduleEntry) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedule_entries (id, user_id, payload) VALUES (?1, ?2, ?3)",
            params![entry.id, entry.user_id, Self::encode(&entry)?],
        )?;
        Ok(())
    }

    async fn update_entry(&self, entry: ScheduleEntry) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE schedule_entries SET user_id = ?2, payload = ?3 WHERE id = ?1",
            params![entry.id, entry.user_id, Self::encode(&entry)?],
        )?;
        if n == 0 {
            return Err(EngineError::not_found("schedule entry", &entry.id));
        }
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM schedule_entries WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    async fn entry(&self, id: &str) -> EngineResult<Option<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        Self::load_one(&conn, "schedule_entries", id)
    }

    async fn entries(&self) -> EngineResult<Vec<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let mut out: Vec<ScheduleEntry> = Self::load_all(&conn, "schedule_entries")?;
        out.sort_by_key(|e| (e.next_run, e.id.clone()));
        Ok(out)
    }

    async fn entries_for_user(&self, user_id: &str) -> EngineResult<Vec<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        Self::load_by(&conn, "schedule_entries", "user_id", user_id)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> EngineResult<Vec<ScheduleEntry>> {
        // 连接锁串行化整个「筛选 + 打标」段，效果等同 CAS
        let conn = self.conn.lock().await;
        let all: Vec<ScheduleEntry> = Self::load_all(&conn, "schedule_entries")?;
        let mut claimed = Vec::new();
        for mut entry in all {
            if !entry.is_due(now) {
                continue;
            }
            if let Some(at) = entry.claimed_at {
                if now - at < stale_after {
                    continue;
                }
            }
            entry.claimed_at = Some(now);
            conn.execute(
                "UPDATE schedule_entries SET payload = ?2 WHERE id = ?1",
                params![entry.id, Self::encode(&entry)?],
            )?;
            claimed.push(entry);
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
        let conn = self.conn.lock().await;
        let mut entry: ScheduleEntry = Self::load_one(&conn, "schedule_entries", id)?
            .ok_or_else(|| EngineError::not_found("schedule entry", id))?;
        entry.claimed_at = None;
        entry.last_run = Some(now);
        entry.last_outcome = Some(outcome.to_string());
        if let Some(next) = next_run {
            entry.next_run = next;
        }
        entry.enabled = enabled;
        conn.execute(
            "UPDATE schedule_entries SET payload = ?2 WHERE id = ?1",
            params![id, Self::encode(&entry)?],
        )?;
        Ok(())
    }
}
