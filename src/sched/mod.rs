//! Agent Scheduler：到期条目的类 cron 驱动
//!
//! 不实现任何调度语义本身：持有 ScheduleStore、认领到期条目、
//! 逐条调用编排器，然后推进 next_run（周期条目）或禁用（一次性条目）。
//! 「每个到期最多执行一次」由存储层的 CAS 认领保证；本层只负责
//! 在执行完毕后用 finish_entry 释放认领并写回结果。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::Serialize;

use crate::domain::{ScheduleEntry, ScheduleKind, UserId};
use crate::error::EngineResult;
use crate::orchestrator::{Orchestrator, RunOptions, SequenceSpec};
use crate::store::ScheduleStore;

/// 一次到期扫描的汇总
#[derive(Debug, Clone, Serialize, Default)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// 到期条目驱动器
pub struct AgentScheduler {
    store: Arc<dyn ScheduleStore>,
    orchestrator: Arc<Orchestrator>,
}

impl AgentScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub async fn create(&self, entry: ScheduleEntry) -> EngineResult<()> {
        tracing::info!(entry = %entry.id, agent = %entry.agent, "Schedule entry created");
        self.store.insert_entry(entry).await
    }

    pub async fn update(&self, entry: ScheduleEntry) -> EngineResult<()> {
        self.store.update_entry(entry).await
    }

    pub async fn delete(&self, id: &str) -> EngineResult<bool> {
        self.store.delete_entry(id).await
    }

    pub async fn entry(&self, id: &str) -> EngineResult<Option<ScheduleEntry>> {
        self.store.entry(id).await
    }

    pub async fn entries(&self) -> EngineResult<Vec<ScheduleEntry>> {
        self.store.entries().await
    }

    pub async fn entries_for_user(&self, user_id: &str) -> EngineResult<Vec<ScheduleEntry>> {
        self.store.entries_for_user(user_id).await
    }

    /// 处理全部到期条目：认领 → 并发执行 → 写回。
    /// 重叠扫描中后来者拿不到同一条目（CAS + 陈旧窗口）。
    pub async fn process_due(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let stale_after =
            Duration::seconds(self.orchestrator.ctx().cfg.scheduler.stale_claim_secs);
        let claimed = self.store.claim_due(now, stale_after).await?;
        if claimed.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };
        let results = join_all(
            claimed
                .into_iter()
                .map(|entry| self.execute_entry(entry, now)),
        )
        .await;
        for ok in results {
            if ok {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        tracing::info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            "Due-entry sweep finished"
        );
        Ok(report)
    }

    /// 扇出辅助：为每个还没有启用监控条目的用户创建标准监控
    pub async fn ensure_monitoring(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let interval = self
            .orchestrator
            .ctx()
            .cfg
            .scheduler
            .default_interval_min;
        let users = self.orchestrator.ctx().store.user_ids().await?;
        let mut created = 0usize;
        for user in users {
            let existing = self.store.entries_for_user(&user).await?;
            if existing.iter().any(|e| e.enabled) {
                continue;
            }
            self.store
                .insert_entry(ScheduleEntry::standard_monitoring(user.clone(), interval, now))
                .await?;
            created += 1;
        }
        if created > 0 {
            tracing::info!(created, "Standard monitoring fanned out");
        }
        Ok(created)
    }

    /// 执行一条已认领的条目并写回；返回是否成功
    async fn execute_entry(&self, entry: ScheduleEntry, now: DateTime<Utc>) -> bool {
        let users: Vec<UserId> = match &entry.user_id {
            Some(user) => vec![user.clone()],
            // 无属主条目按用户扇出
            None => match self.orchestrator.ctx().store.user_ids().await {
                Ok(users) => users,
                Err(e) => {
                    tracing::error!(entry = %entry.id, error = %e, "User fan-out failed");
                    let _ = self
                        .finish(&entry, now, &format!("fan-out failed: {e}"))
                        .await;
                    return false;
                }
            },
        };

        let opts = RunOptions {
            bypass_rate_limit: true,
        };
        let mut failures: Vec<String> = Vec::new();
        for user in &users {
            let outcome = match entry.sequence {
                Some(sequence) => self
                    .orchestrator
                    .run_sequence(SequenceSpec::Named(sequence), user, opts, now)
                    .await
                    .map(|r| r.succeeded()),
                None => self
                    .orchestrator
                    .run_agent(entry.agent, user, entry.params.clone(), opts, now)
                    .await
                    .map(|_| true),
            };
            match outcome {
                Ok(true) => {}
                Ok(false) => failures.push(format!("{user}: step failure")),
                Err(e) => failures.push(format!("{user}: {e}")),
            }
        }

        let ok = failures.is_empty();
        let outcome_text = if ok {
            "ok".to_string()
        } else {
            format!("failed: {}", failures.join("; "))
        };
        if let Err(e) = self.finish(&entry, now, &outcome_text).await {
            tracing::error!(entry = %entry.id, error = %e, "Failed to finalize schedule entry");
            return false;
        }
        ok
    }

    async fn finish(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
        outcome: &str,
    ) -> EngineResult<()> {
        let (next_run, enabled) = match entry.schedule_kind {
            ScheduleKind::Recurring => {
                // 从原 next_run 推进，落后太多时直接贴到 now 之后，避免补跑风暴
                let mut next = entry.next_run + entry.interval();
                if next <= now {
                    next = now + entry.interval();
                }
                (Some(next), true)
            }
            ScheduleKind::OneTime => (None, false),
        };
        self.store
            .finish_entry(&entry.id, now, outcome, next_run, enabled)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{AgentKind, Category, Difficulty, SequenceKind, Topic};
    use crate::engine::EngineCtx;
    use crate::llm::MockSummarizer;
    use crate::orchestrator::Orchestrator;
    use crate::store::{InMemoryStore, StudyStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap()
    }

    async fn scheduler_with_plan() -> (AgentScheduler, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
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
        let ctx = EngineCtx::new(
            store.clone(),
            Some(Arc::new(MockSummarizer)),
            Arc::new(AppConfig::default()),
        );
        let orchestrator = Arc::new(Orchestrator::new(ctx));
        orchestrator
            .run_agent(
                AgentKind::Scheduler,
                "u1",
                json!({
                    "availability": {
                        "weekdays": ["Mon", "Wed", "Fri"],
                        "minutes_per_day": 120,
                        "band": "Morning"
                    },
                    "exam_date": "2025-03-17T07:00:00Z",
                }),
                crate::orchestrator::RunOptions::default(),
                now(),
            )
            .await
            .unwrap();
        (AgentScheduler::new(store.clone(), orchestrator), store)
    }

    #[tokio::test]
    async fn test_due_entry_executes_once_across_overlapping_sweeps() {
        let (sched, _store) = scheduler_with_plan().await;
        sched
            .create(ScheduleEntry::standard_monitoring("u1".into(), 60, now()))
            .await
            .unwrap();

        // 模拟重叠扫描：两次同时认领，只有一次真正执行
        let (first, second) = tokio::join!(sched.process_due(now()), sched.process_due(now()));
        let total = first.unwrap().claimed + second.unwrap().claimed;
        assert_eq!(total, 1, "same due occurrence must be claimed exactly once");
    }

    #[tokio::test]
    async fn test_recurring_entry_advances_next_run() {
        let (sched, _) = scheduler_with_plan().await;
        let entry = ScheduleEntry::standard_monitoring("u1".into(), 60, now());
        let id = entry.id.clone();
        sched.create(entry).await.unwrap();

        sched.process_due(now()).await.unwrap();
        let after = sched.entry(&id).await.unwrap().unwrap();
        assert!(after.enabled);
        assert!(after.next_run > now());
        assert!(after.claimed_at.is_none());
        assert_eq!(after.last_outcome.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_one_time_entry_disabled_after_run() {
        let (sched, _) = scheduler_with_plan().await;
        let mut entry = ScheduleEntry::standard_monitoring("u1".into(), 60, now());
        entry.schedule_kind = ScheduleKind::OneTime;
        entry.sequence = Some(SequenceKind::Standard);
        let id = entry.id.clone();
        sched.create(entry).await.unwrap();

        let report = sched.process_due(now()).await.unwrap();
        assert_eq!(report.claimed, 1);
        let after = sched.entry(&id).await.unwrap().unwrap();
        assert!(!after.enabled, "one-time entry must be disabled after execution");

        // 再扫一遍：没有可认领条目
        let second = sched.process_due(now()).await.unwrap();
        assert_eq!(second.claimed, 0);
    }

    #[tokio::test]
    async fn test_fan_out_creates_missing_monitoring_entries() {
        let (sched, _) = scheduler_with_plan().await;
        let created = sched.ensure_monitoring(now()).await.unwrap();
        assert_eq!(created, 1);
        // 幂等：已有条目的用户不再新建
        let again = sched.ensure_monitoring(now()).await.unwrap();
        assert_eq!(again, 0);
    }
}
