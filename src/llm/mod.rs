//! 自然语言增强（可选软依赖）
//!
//! Monitor / Adaptation 通过注入的 Summarizer 获取人类可读摘要与建议；
//! 任何失败都映射为 EngineError::Enrichment，调用方记录后忽略，
//! 规则产出始终是权威结果。

mod mock;
mod openai;
mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use mock::MockSummarizer;
pub use openai::OpenAiSummarizer;
pub use traits::Summarizer;

/// 根据配置与环境变量选择增强后端（OpenAI 兼容 / Mock）
pub fn create_summarizer_from_config(cfg: &AppConfig) -> Arc<dyn Summarizer> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "openai" && std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!("Using OpenAI summarizer ({})", cfg.llm.model);
        Arc::new(OpenAiSummarizer::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock summarizer");
        Arc::new(MockSummarizer)
    }
}
