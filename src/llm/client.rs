//! 统一 LLM 客户端

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::anthropic::stream_anthropic;
use super::format::ApiFormat;
use super::openai::stream_openai;
use super::types::{
    estimate_tokens, ChatChunk, ChatMessage, ChatOptions, LlmError, StreamCollectResult,
    TokenUsage,
};
use crate::services::batch::{CallParams, Completion, Upstream, UpstreamError};

/// 文档生成的系统提示词
const DOC_SYSTEM_PROMPT: &str =
    "You are a senior software engineer who writes precise, well-structured technical documentation for source code.";

/// 统一 LLM 客户端
///
/// 支持 OpenAI 和 Anthropic API 格式，根据模型名称自动选择
pub struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl LlmClient {
    /// 创建新的 LLM 客户端
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(LlmError::ConfigError("API Key is required".to_string()));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(LlmError::HttpError)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
        })
    }

    /// 流式聊天（自动检测 API 格式）
    pub fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        options: ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
        let api_format = ApiFormat::detect(model);
        let endpoint = api_format.endpoint(&self.base_url);
        debug!("LLM request: model={}, api_format={}", model, api_format.as_str());

        match api_format {
            ApiFormat::OpenAi => {
                stream_openai(&self.client, &self.api_key, &endpoint, messages, model, &options)
            }
            ApiFormat::Anthropic => {
                stream_anthropic(&self.client, &self.api_key, &endpoint, messages, model, &options)
            }
        }
    }

    /// 流式请求并收集完整响应
    pub async fn stream_and_collect(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        options: ChatOptions,
    ) -> Result<StreamCollectResult, LlmError> {
        let mut stream = self.stream_chat(messages, model, options);
        let mut result = StreamCollectResult::default();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            result.chunk_count += 1;

            if let Some(content) = chunk.content {
                result.content.push_str(&content);
            }
            if chunk.finish_reason.is_some() {
                result.finish_reason = chunk.finish_reason;
            }
            if let Some(usage) = chunk.usage {
                result.usage = Some(merge_usage(result.usage, usage));
            }
        }

        Ok(result)
    }
}

/// 合并分段上报的用量：每个字段取最新的非零值
fn merge_usage(current: Option<TokenUsage>, update: TokenUsage) -> TokenUsage {
    let current = current.unwrap_or_default();
    TokenUsage {
        prompt_tokens: if update.prompt_tokens > 0 {
            update.prompt_tokens
        } else {
            current.prompt_tokens
        },
        completion_tokens: if update.completion_tokens > 0 {
            update.completion_tokens
        } else {
            current.completion_tokens
        },
    }
}

/// 服务商缺失的用量字段按文本估算
fn resolve_usage(reported: Option<TokenUsage>, prompt: &str, response: &str) -> TokenUsage {
    let reported = reported.unwrap_or_default();
    TokenUsage {
        prompt_tokens: if reported.prompt_tokens > 0 {
            reported.prompt_tokens
        } else {
            estimate_tokens(prompt)
        },
        completion_tokens: if reported.completion_tokens > 0 {
            reported.completion_tokens
        } else {
            estimate_tokens(response)
        },
    }
}

#[async_trait]
impl Upstream for LlmClient {
    async fn call(&self, prompt: &str, params: &CallParams) -> Result<Completion, UpstreamError> {
        let messages = vec![ChatMessage::system(DOC_SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let options = ChatOptions {
            temperature: Some(params.temperature),
            max_tokens: Some(params.max_tokens),
        };

        let collected = self
            .stream_and_collect(messages, &params.model, options)
            .await
            .map_err(|e| UpstreamError::new(e.failure_kind(), e.to_string()))?;

        if collected.content.trim().is_empty() {
            return Err(UpstreamError::retryable(format!(
                "empty response ({} chunks, finish_reason={:?})",
                collected.chunk_count, collected.finish_reason
            )));
        }

        let usage = resolve_usage(collected.usage, prompt, &collected.content);
        Ok(Completion {
            text: collected.content,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_api_key() {
        let result = LlmClient::new("", "https://api.openai.com", Duration::from_secs(5));
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }

    #[test]
    fn test_merge_usage_keeps_latest_non_zero() {
        let start = merge_usage(None, TokenUsage::new(40, 0));
        let end = merge_usage(Some(start), TokenUsage::new(0, 12));
        assert_eq!(end, TokenUsage::new(40, 12));
    }

    #[test]
    fn test_resolve_usage_falls_back_to_estimate() {
        let usage = resolve_usage(None, "document this code", "Module docs here");
        assert_eq!(usage, TokenUsage::new(3, 3));

        let usage = resolve_usage(Some(TokenUsage::new(100, 0)), "a b", "x y z");
        assert_eq!(usage, TokenUsage::new(100, 3));
    }
}
