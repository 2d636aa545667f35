//! 就绪度评分
//!
//! 按类别做信心加权平均（无分数用完成代理值），再按主题重要度
//! 加权出总分。每次触发整体重算并追加新记录，历史只增不改。
//! 用户没有计划或没有任何成绩时返回 None——这是正常结果，不是错误。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Category, Performance, ReadinessScore, Topic};
use crate::error::EngineResult;
use crate::store::PerformanceFilter;

use super::EngineCtx;

/// 重算并追加一条就绪度快照；无计划或无成绩时为 no-op
pub async fn compute(
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<Option<ReadinessScore>> {
    if ctx.store.active_plan(user_id, now).await?.is_none() {
        return Ok(None);
    }
    let perfs = ctx
        .store
        .performances(&PerformanceFilter::for_user(user_id))
        .await?;
    if perfs.is_empty() {
        return Ok(None);
    }
    let topics = ctx.store.topics().await?;

    let score = score_from(&perfs, &topics, ctx, user_id, now);
    ctx.store.insert_readiness(score.clone()).await?;
    tracing::debug!(user = %user_id, overall = score.overall_score, "Readiness recomputed");
    Ok(Some(score))
}

fn score_from(
    perfs: &[Performance],
    topics: &[Topic],
    ctx: &EngineCtx,
    user_id: &str,
    now: DateTime<Utc>,
) -> ReadinessScore {
    let cfg = &ctx.cfg.readiness;
    let topic_of = |id: &str| topics.iter().find(|t| t.id == id);

    // 类别内：信心加权的分数均值（无分数用完成代理）
    let mut acc: BTreeMap<Category, (f64, f64)> = BTreeMap::new();
    for perf in perfs {
        let Some(topic) = topic_of(&perf.topic_id) else {
            tracing::debug!(topic = %perf.topic_id, "Performance references unknown topic, skipping");
            continue;
        };
        let value = perf.score.unwrap_or(if perf.completed {
            cfg.proxy_completed
        } else {
            cfg.proxy_incomplete
        });
        let weight = perf.confidence.clamp(1, 5) as f64;
        let entry = acc.entry(topic.category).or_insert((0.0, 0.0));
        entry.0 += value * weight;
        entry.1 += weight;
    }

    let category_scores: BTreeMap<Category, f64> = acc
        .iter()
        .filter(|(_, v)| v.1 > 0.0)
        .map(|(cat, v)| (*cat, (v.0 / v.1).clamp(0.0, 100.0)))
        .collect();

    // 类别权重 = 该类别全部主题的重要度之和
    let category_importance = |cat: Category| -> f64 {
        let sum: i64 = topics
            .iter()
            .filter(|t| t.category == cat)
            .map(|t| t.importance.max(1) as i64)
            .sum();
        sum.max(1) as f64
    };

    let (weighted, total_weight) = category_scores.iter().fold(
        (0.0_f64, 0.0_f64),
        |(acc_score, acc_weight), (cat, score)| {
            let w = category_importance(*cat);
            (acc_score + score * w, acc_weight + w)
        },
    );
    let overall = if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let weak_areas: Vec<Category> = category_scores
        .iter()
        .filter(|(_, s)| **s < cfg.weak_threshold)
        .map(|(c, _)| *c)
        .collect();
    let strong_areas: Vec<Category> = category_scores
        .iter()
        .filter(|(_, s)| **s > cfg.strong_threshold)
        .map(|(c, _)| *c)
        .collect();

    // 预测分：总分加上随完成率缓慢收敛的余量
    let completed_ratio =
        perfs.iter().filter(|p| p.completed).count() as f64 / perfs.len() as f64;
    let projected = (overall + (100.0 - overall) * 0.15 * completed_ratio).clamp(0.0, 100.0);

    ReadinessScore {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        overall_score: overall,
        category_scores,
        weak_areas,
        strong_areas,
        projected_score: projected,
        created_at: now,
    }
}
