//! 边界限流
//!
//! 按（用户, 端点类别）的固定冷却窗口，约束用户手动触发重跑的频率。
//! 这是建议性节流，不是正确性机制：调度器驱动的运行直接旁路。

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::RateLimitSection;
use crate::error::{EngineError, EngineResult};

/// 端点类别；每类各有独立冷却窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Plan,
    Monitor,
    Adaptation,
    Remediation,
}

/// 固定窗口限流器
pub struct RateLimiter {
    cooldowns: HashMap<EndpointClass, Duration>,
    last_hit: Mutex<HashMap<(String, EndpointClass), DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn from_config(cfg: &RateLimitSection) -> Self {
        let mut cooldowns = HashMap::new();
        cooldowns.insert(EndpointClass::Plan, Duration::seconds(cfg.plan_cooldown_secs));
        cooldowns.insert(
            EndpointClass::Monitor,
            Duration::seconds(cfg.monitor_cooldown_secs),
        );
        cooldowns.insert(
            EndpointClass::Adaptation,
            Duration::seconds(cfg.adaptation_cooldown_secs),
        );
        cooldowns.insert(
            EndpointClass::Remediation,
            Duration::seconds(cfg.remediation_cooldown_secs),
        );
        Self {
            cooldowns,
            last_hit: Mutex::new(HashMap::new()),
        }
    }

    /// 冷却窗口内的重复触发返回 RateLimited；通过时记录本次触发
    pub fn check(
        &self,
        user_id: &str,
        class: EndpointClass,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let cooldown = self
            .cooldowns
            .get(&class)
            .copied()
            .unwrap_or_else(Duration::zero);
        let key = (user_id.to_string(), class);

        let mut last_hit = self
            .last_hit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(prev) = last_hit.get(&key) {
            let elapsed = now - *prev;
            if elapsed < cooldown {
                let retry_after_secs = (cooldown - elapsed).num_seconds().max(1);
                return Err(EngineError::RateLimited { retry_after_secs });
            }
        }
        last_hit.insert(key, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_second_hit_inside_window_is_limited() {
        let limiter = RateLimiter::from_config(&RateLimitSection::default());
        limiter.check("u1", EndpointClass::Monitor, now()).unwrap();
        let err = limiter
            .check("u1", EndpointClass::Monitor, now() + Duration::seconds(30))
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
    }

    #[test]
    fn test_window_expiry_and_isolation() {
        let limiter = RateLimiter::from_config(&RateLimitSection::default());
        limiter.check("u1", EndpointClass::Monitor, now()).unwrap();
        // 其他用户与其他类别不受影响
        limiter.check("u2", EndpointClass::Monitor, now()).unwrap();
        limiter.check("u1", EndpointClass::Remediation, now()).unwrap();
        // 窗口过后恢复
        limiter
            .check("u1", EndpointClass::Monitor, now() + Duration::seconds(601))
            .unwrap();
    }
}
