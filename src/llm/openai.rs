//! OpenAI 兼容 Summarizer
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；
//! 单轮对话，取首条 choice 的 content。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::domain::{Adaptation, Alert};
use crate::engine::monitor::PlanStats;
use crate::error::{EngineError, EngineResult};

use super::Summarizer;

const SYSTEM_PROMPT: &str = "You are a study coach. Summarize the learner's progress \
in two or three plain sentences. Be concrete and encouraging, no markdown.";

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiSummarizer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    async fn complete(&self, user_prompt: String) -> EngineResult<String> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()
                    .map_err(|e| EngineError::Enrichment(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()
                    .map_err(|e| EngineError::Enrichment(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| EngineError::Enrichment(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| EngineError::Enrichment(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(EngineError::Enrichment("empty completion".to_string()));
        }
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize_monitor(
        &self,
        stats: &PlanStats,
        alerts: &[Alert],
    ) -> EngineResult<String> {
        let alert_lines: Vec<String> = alerts
            .iter()
            .map(|a| format!("- [{:?}/{:?}] {}", a.alert_type, a.severity, a.message))
            .collect();
        let prompt = format!(
            "Progress: {} of {} tasks completed, {} missed (ratio {:.0}%). \
             Average performance: {}.\nNew alerts:\n{}",
            stats.completed_tasks,
            stats.total_tasks,
            stats.missed_tasks,
            stats.missed_ratio * 100.0,
            stats
                .average_performance
                .map(|p| format!("{p:.1}"))
                .unwrap_or_else(|| "n/a".to_string()),
            if alert_lines.is_empty() {
                "(none)".to_string()
            } else {
                alert_lines.join("\n")
            },
        );
        self.complete(prompt).await
    }

    async fn suggest_adaptations(&self, adaptations: &[Adaptation]) -> EngineResult<String> {
        let lines: Vec<String> = adaptations
            .iter()
            .map(|a| format!("- {}: {}", a.adaptation_type.as_str(), a.description))
            .collect();
        let prompt = format!(
            "The study calendar was just adjusted:\n{}\n\
             Suggest at most two further adjustments the learner could consider.",
            if lines.is_empty() {
                "(no changes)".to_string()
            } else {
                lines.join("\n")
            },
        );
        self.complete(prompt).await
    }
}
