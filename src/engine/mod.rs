//! 核心引擎层：排期、就绪度、状态迁移、监控、自适应、补救
//!
//! 所有引擎函数通过 EngineCtx 访问存储与可选的自然语言增强；
//! 时间一律由调用方显式传入，便于测试注入固定时钟。

pub mod adaptation;
pub mod availability;
pub mod monitor;
pub mod planner;
pub mod readiness;
pub mod remediation;
pub mod transition;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::Summarizer;
use crate::store::StudyStore;

/// 引擎上下文：存储 + 可选增强 + 配置阈值
#[derive(Clone)]
pub struct EngineCtx {
    pub store: Arc<dyn StudyStore>,
    /// 可独立失败的增强能力；None 表示完全关闭
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub cfg: Arc<AppConfig>,
}

impl EngineCtx {
    pub fn new(
        store: Arc<dyn StudyStore>,
        summarizer: Option<Arc<dyn Summarizer>>,
        cfg: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            summarizer,
            cfg,
        }
    }
}
