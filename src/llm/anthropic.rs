//! Anthropic Messages API 流式实现

use async_stream::try_stream;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::{debug, error};

use super::openai::{parse_sse_data, SseLineBuffer};
use super::types::{ChatChunk, ChatMessage, ChatOptions, LlmError, TokenUsage};

/// Anthropic 请求载荷
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

/// Anthropic SSE 事件
#[derive(Deserialize, Debug)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    message: Option<AnthropicMessageStart>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    error: Option<AnthropicStreamError>,
}

#[derive(Deserialize, Debug)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AnthropicMessageStart {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize, Debug, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct AnthropicStreamError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// 将单个事件转换为 chunk；流内错误事件（如 overloaded_error）转换为错误
fn chunk_from_event(event: AnthropicEvent) -> Result<Option<ChatChunk>, LlmError> {
    match event.event_type.as_str() {
        "message_start" => Ok(event
            .message
            .and_then(|m| m.usage)
            .map(|u| ChatChunk {
                usage: Some(TokenUsage::new(u.input_tokens, 0)),
                ..Default::default()
            })),
        "content_block_delta" => Ok(event
            .delta
            .filter(|d| d.delta_type.as_deref() == Some("text_delta"))
            .and_then(|d| d.text)
            .map(|text| ChatChunk {
                content: Some(text),
                ..Default::default()
            })),
        "message_delta" => {
            let finish_reason = event.delta.and_then(|d| d.stop_reason);
            let usage = event.usage.map(|u| TokenUsage::new(u.input_tokens, u.output_tokens));
            if finish_reason.is_none() && usage.is_none() {
                return Ok(None);
            }
            Ok(Some(ChatChunk {
                content: None,
                finish_reason,
                usage,
            }))
        }
        "error" => {
            let err = event.error.unwrap_or(AnthropicStreamError {
                error_type: "unknown".to_string(),
                message: String::new(),
            });
            // overloaded_error 对应 HTTP 529
            let status = match err.error_type.as_str() {
                "overloaded_error" => 529,
                "rate_limit_error" => 429,
                "api_error" => 500,
                "invalid_request_error" => 400,
                "authentication_error" => 401,
                _ => return Err(LlmError::StreamError(err.message)),
            };
            Err(LlmError::ApiError {
                status,
                message: err.message,
            })
        }
        _ => Ok(None),
    }
}

/// 流式调用 Anthropic API
pub fn stream_anthropic(
    client: &Client,
    api_key: &str,
    endpoint: &str,
    messages: Vec<ChatMessage>,
    model: &str,
    options: &ChatOptions,
) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
    let endpoint = endpoint.to_string();
    let api_key = api_key.to_string();
    let model = model.to_string();
    let options = options.clone();
    let client = client.clone();

    Box::pin(try_stream! {
        // 分离系统消息
        let mut system_content: Option<String> = None;
        let mut anthropic_messages: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            if msg.role == "system" {
                system_content = Some(msg.content);
            } else {
                anthropic_messages.push(AnthropicMessage {
                    role: msg.role,
                    content: msg.content,
                });
            }
        }

        let payload = AnthropicRequest {
            model: model.clone(),
            messages: anthropic_messages,
            system: system_content,
            stream: true,
            max_tokens: options.max_tokens.unwrap_or(4096),
            temperature: options.temperature,
        };

        debug!("Anthropic API request: endpoint={}, model={}", endpoint, model);

        let response = client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key.as_str())
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "Anthropic API error: status={}, body={}",
                status_code,
                error_text.chars().take(500).collect::<String>()
            );
            Err(LlmError::ApiError {
                status: status_code,
                message: error_text,
            })?;
            unreachable!();
        }

        let mut lines = SseLineBuffer::default();
        let mut stream = response.bytes_stream();

        use futures::StreamExt;
        while let Some(chunk_result) = stream.next().await {
            let bytes = chunk_result?;

            for line in lines.push(&bytes) {
                let data = match parse_sse_data(&line) {
                    Some(Some(data)) => data,
                    Some(None) => return,
                    None => continue,
                };

                match serde_json::from_str::<AnthropicEvent>(data) {
                    Ok(event) => {
                        let is_stop = event.event_type == "message_stop";
                        if let Some(chunk) = chunk_from_event(event)? {
                            yield chunk;
                        }
                        if is_stop {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Failed to parse Anthropic event: {}, data: {}", e, data);
                    }
                }
            }
        }
    })
}
