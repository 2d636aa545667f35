//! Agent 编排器
//!
//! 封闭的 AgentKind 枚举经由 StudyAgent 接口派发，非法 Agent 类别在
//! 编译期即不存在。支持单 Agent 运行、固定序列（standard /
//! comprehensive）与任意有序列表；Adaptation 步骤消费上游 Monitor 的
//! 产出。部分失败策略：Monitor 是指定的 continue-on-error 步骤，
//! 其余步骤失败后剩余步骤记为 Skipped；失败折叠进聚合结果，
//! 不会越过编排器边界抛出。单次运行内不重试——重试属于调度器。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::{AgentKind, SequenceKind, UserId};
use crate::engine::adaptation::{self, AdaptationReport};
use crate::engine::monitor::{self, MonitorReport};
use crate::engine::planner::{self, PlanReport};
use crate::engine::remediation::{self, RemediationRun};
use crate::engine::EngineCtx;
use crate::error::{EngineError, EngineResult};
use crate::ratelimit::{EndpointClass, RateLimiter};

/// 一次 Agent 调用的输入
pub struct AgentRequest {
    pub user_id: UserId,
    pub params: Value,
    /// 上游 Monitor 步骤的产出（序列中传递）
    pub monitor: Option<MonitorReport>,
    pub now: DateTime<Utc>,
}

/// 各 Agent 的类型化产出
#[derive(Debug, Clone, Serialize)]
pub enum AgentOutput {
    Plan(PlanReport),
    Monitor(MonitorReport),
    Adaptation(AdaptationReport),
    Remediation(RemediationRun),
}

impl AgentOutput {
    /// 本步产出是否带着「增强失败」降级标记
    fn enrichment_failed(&self) -> bool {
        match self {
            AgentOutput::Monitor(r) => r.enrichment_failed,
            AgentOutput::Adaptation(r) => r.enrichment_failed,
            _ => false,
        }
    }
}

/// 单个可编排 Agent 的接口
#[async_trait]
pub trait StudyAgent: Send + Sync {
    fn kind(&self) -> AgentKind;
    async fn run(&self, ctx: &EngineCtx, req: AgentRequest) -> EngineResult<AgentOutput>;
}

/// 计划构建 Agent（agentType = scheduler）
struct SchedulerAgent;

#[async_trait]
impl StudyAgent for SchedulerAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Scheduler
    }

    async fn run(&self, ctx: &EngineCtx, req: AgentRequest) -> EngineResult<AgentOutput> {
        let request = planner::parse_request(&req.user_id, &req.params)?;
        let report = planner::build_plan(ctx, &request, req.now).await?;
        Ok(AgentOutput::Plan(report))
    }
}

struct MonitorAgent;

#[async_trait]
impl StudyAgent for MonitorAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Monitor
    }

    async fn run(&self, ctx: &EngineCtx, req: AgentRequest) -> EngineResult<AgentOutput> {
        let report = monitor::run(ctx, &req.user_id, None, req.now).await?;
        Ok(AgentOutput::Monitor(report))
    }
}

struct AdaptationAgent;

#[async_trait]
impl StudyAgent for AdaptationAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Adaptation
    }

    async fn run(&self, ctx: &EngineCtx, req: AgentRequest) -> EngineResult<AgentOutput> {
        let report = adaptation::run(ctx, &req.user_id, req.monitor.as_ref(), req.now).await?;
        Ok(AgentOutput::Adaptation(report))
    }
}

/// 补救 Agent 的 params
#[derive(Debug, Default, serde::Deserialize)]
struct RemediationParams {
    topic_id: Option<String>,
    alert_id: Option<String>,
}

struct RemediationAgent;

#[async_trait]
impl StudyAgent for RemediationAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Remediation
    }

    async fn run(&self, ctx: &EngineCtx, req: AgentRequest) -> EngineResult<AgentOutput> {
        let params: RemediationParams = if req.params.is_null() {
            RemediationParams::default()
        } else {
            serde_json::from_value(req.params.clone())
                .map_err(|e| EngineError::InvalidParams(format!("remediation params: {e}")))?
        };
        let run = remediation::run(
            ctx,
            &req.user_id,
            params.topic_id.as_deref(),
            params.alert_id.as_deref(),
            req.now,
        )
        .await?;
        Ok(AgentOutput::Remediation(run))
    }
}

impl AgentKind {
    /// 枚举 → 实现实例（单元结构体可静态提升）
    fn instance(self) -> &'static dyn StudyAgent {
        match self {
            AgentKind::Scheduler => &SchedulerAgent,
            AgentKind::Monitor => &MonitorAgent,
            AgentKind::Adaptation => &AdaptationAgent,
            AgentKind::Remediation => &RemediationAgent,
        }
    }

    fn endpoint_class(self) -> EndpointClass {
        match self {
            AgentKind::Scheduler => EndpointClass::Plan,
            AgentKind::Monitor => EndpointClass::Monitor,
            AgentKind::Adaptation => EndpointClass::Adaptation,
            AgentKind::Remediation => EndpointClass::Remediation,
        }
    }
}

/// 运行选项；调度器驱动的运行旁路限流
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub bypass_rate_limit: bool,
}

/// 单步状态：成功 / 增强降级的成功 / 失败 / 因上游失败未执行
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Degraded,
    Failed(String),
    Skipped,
}

/// 序列中一步的结果
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub agent: AgentKind,
    pub status: StepStatus,
    pub output: Option<AgentOutput>,
}

/// 聚合结果：调用方看到逐步状态，永远不是裸异常
#[derive(Debug, Serialize)]
pub struct SequenceReport {
    pub user_id: UserId,
    pub steps: Vec<StepReport>,
}

impl SequenceReport {
    /// 全部步骤成功（允许增强降级）
    pub fn succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Degraded))
    }
}

/// 序列说明：固定名字或显式 Agent 列表
#[derive(Debug, Clone)]
pub enum SequenceSpec {
    Named(SequenceKind),
    Custom(Vec<AgentKind>),
}

impl SequenceSpec {
    fn steps(&self) -> Vec<AgentKind> {
        match self {
            SequenceSpec::Named(kind) => kind.steps().to_vec(),
            SequenceSpec::Custom(list) => list.clone(),
        }
    }
}

/// 编排器：持有引擎上下文与限流器
pub struct Orchestrator {
    ctx: EngineCtx,
    limiter: RateLimiter,
}

impl Orchestrator {
    pub fn new(ctx: EngineCtx) -> Self {
        let limiter = RateLimiter::from_config(&ctx.cfg.ratelimit);
        Self { ctx, limiter }
    }

    pub fn ctx(&self) -> &EngineCtx {
        &self.ctx
    }

    /// 运行单个 Agent。单步请求的失败直接上抛（带类型错误）。
    pub async fn run_agent(
        &self,
        kind: AgentKind,
        user_id: &str,
        params: Value,
        opts: RunOptions,
        now: DateTime<Utc>,
    ) -> EngineResult<StepReport> {
        if !opts.bypass_rate_limit {
            self.limiter.check(user_id, kind.endpoint_class(), now)?;
        }

        tracing::info!(agent = %kind, user = %user_id, "Running agent");
        let output = kind
            .instance()
            .run(
                &self.ctx,
                AgentRequest {
                    user_id: user_id.to_string(),
                    params,
                    monitor: None,
                    now,
                },
            )
            .await?;

        let status = if output.enrichment_failed() {
            StepStatus::Degraded
        } else {
            StepStatus::Succeeded
        };
        Ok(StepReport {
            agent: kind,
            status,
            output: Some(output),
        })
    }

    /// 运行一条序列。除入口限流外不向外抛错：逐步状态都折叠在
    /// SequenceReport 里。
    pub async fn run_sequence(
        &self,
        spec: SequenceSpec,
        user_id: &str,
        opts: RunOptions,
        now: DateTime<Utc>,
    ) -> EngineResult<SequenceReport> {
        let steps = spec.steps();
        if let (false, Some(first)) = (opts.bypass_rate_limit, steps.first()) {
            self.limiter.check(user_id, first.endpoint_class(), now)?;
        }

        let mut reports: Vec<StepReport> = Vec::with_capacity(steps.len());
        let mut last_monitor: Option<MonitorReport> = None;
        let mut abort = false;

        for (index, kind) in steps.iter().copied().enumerate() {
            if abort {
                reports.push(StepReport {
                    agent: kind,
                    status: StepStatus::Skipped,
                    output: None,
                });
                continue;
            }

            tracing::info!(agent = %kind, user = %user_id, step = index, "Running sequence step");
            let request = AgentRequest {
                user_id: user_id.to_string(),
                params: Value::Null,
                monitor: last_monitor.clone(),
                now,
            };
            match kind.instance().run(&self.ctx, request).await {
                Ok(output) => {
                    if let AgentOutput::Monitor(report) = &output {
                        last_monitor = Some(report.clone());
                    }
                    let status = if output.enrichment_failed() {
                        StepStatus::Degraded
                    } else {
                        StepStatus::Succeeded
                    };
                    reports.push(StepReport {
                        agent: kind,
                        status,
                        output: Some(output),
                    });
                }
                Err(e) => {
                    tracing::warn!(agent = %kind, user = %user_id, error = %e, "Sequence step failed");
                    reports.push(StepReport {
                        agent: kind,
                        status: StepStatus::Failed(e.to_string()),
                        output: None,
                    });
                    // Monitor 是指定的 continue-on-error 步骤：
                    // 下游在缺少其产出的情况下继续。其余失败跳过剩余步骤。
                    if kind != AgentKind::Monitor {
                        abort = true;
                    }
                }
            }
        }

        Ok(SequenceReport {
            user_id: user_id.to_string(),
            steps: reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{Category, Difficulty, Topic};
    use crate::llm::MockSummarizer;
    use crate::store::{InMemoryStore, StudyStore};
    use chrono::{Duration, TimeZone, Weekday};
    use serde_json::json;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap()
    }

    async fn seeded_orchestrator() -> Orchestrator {
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
            store,
            Some(Arc::new(MockSummarizer)),
            Arc::new(AppConfig::default()),
        );
        Orchestrator::new(ctx)
    }

    fn plan_params() -> Value {
        json!({
            "availability": {
                "weekdays": ["Mon", "Wed", "Fri"],
                "minutes_per_day": 120,
                "band": "Morning"
            },
            "exam_date": "2025-03-17T07:00:00Z",
        })
    }

    #[tokio::test]
    async fn test_scheduler_agent_builds_plan() {
        let orch = seeded_orchestrator().await;
        let report = orch
            .run_agent(
                AgentKind::Scheduler,
                "u1",
                plan_params(),
                RunOptions::default(),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.status, StepStatus::Succeeded);
        let Some(AgentOutput::Plan(plan)) = report.output else {
            panic!("expected plan output");
        };
        assert!(!plan.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_single_step_failure_propagates() {
        let orch = seeded_orchestrator().await;
        // 没有计划的用户跑 Monitor：单步请求直接拿到类型化错误
        let err = orch
            .run_agent(
                AgentKind::Monitor,
                "nobody",
                Value::Null,
                RunOptions::default(),
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sequence_folds_failures_instead_of_throwing() {
        let orch = seeded_orchestrator().await;
        // 没有计划：Monitor 失败但被记录，Adaptation 仍尝试（随后同样失败），
        // 结果是逐步状态而不是异常
        let report = orch
            .run_sequence(
                SequenceSpec::Named(SequenceKind::Standard),
                "nobody",
                RunOptions::default(),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(matches!(report.steps[0].status, StepStatus::Failed(_)));
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_to_caller() {
        let orch = seeded_orchestrator().await;
        orch.run_agent(
            AgentKind::Scheduler,
            "u1",
            plan_params(),
            RunOptions::default(),
            now(),
        )
        .await
        .unwrap();
        let err = orch
            .run_agent(
                AgentKind::Scheduler,
                "u1",
                plan_params(),
                RunOptions::default(),
                now() + Duration::seconds(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_comprehensive_sequence_runs_all_steps() {
        let orch = seeded_orchestrator().await;
        orch.run_agent(
            AgentKind::Scheduler,
            "u1",
            plan_params(),
            RunOptions::default(),
            now(),
        )
        .await
        .unwrap();

        let report = orch
            .run_sequence(
                SequenceSpec::Named(SequenceKind::Comprehensive),
                "u1",
                RunOptions {
                    bypass_rate_limit: true,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.steps.len(), 3);
        assert!(report.succeeded(), "steps: {:?}", report.steps);
    }
}
