//! OpenAI Chat Completions API 流式实现

use async_stream::try_stream;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::{debug, error};

use super::types::{ChatChunk, ChatMessage, ChatOptions, LlmError, TokenUsage};

/// OpenAI 请求载荷
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// OpenAI SSE 响应块
#[derive(Deserialize, Debug)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize, Debug)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// 解析一行 SSE 数据；返回 `None` 表示忽略该行，`Some(None)` 表示流结束
pub(crate) fn parse_sse_data(line: &str) -> Option<Option<&str>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        Some(None)
    } else {
        Some(Some(data))
    }
}

/// SSE 行缓冲
///
/// 按字节缓存网络块，只在遇到换行时解码整行；多字节字符可能被拆到两个块中。
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// 追加一个网络块，返回其中所有完整的行
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

fn chunk_from_openai(chunk: OpenAiStreamChunk) -> Option<ChatChunk> {
    let usage = chunk
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

    match chunk.choices.into_iter().next() {
        Some(choice) => Some(ChatChunk {
            content: choice.delta.and_then(|d| d.content),
            finish_reason: choice.finish_reason,
            usage,
        }),
        // include_usage 的最后一个块 choices 为空
        None => usage.map(|usage| ChatChunk {
            usage: Some(usage),
            ..Default::default()
        }),
    }
}

/// 流式调用 OpenAI API
pub fn stream_openai(
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
        let payload = OpenAiRequest {
            model: model.clone(),
            messages,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!("OpenAI API request: endpoint={}, model={}", endpoint, model);

        let response = client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: status={}, body={}", status_code, truncate(&error_text, 500));
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

                match serde_json::from_str::<OpenAiStreamChunk>(data) {
                    Ok(chunk) => {
                        if let Some(chat_chunk) = chunk_from_openai(chunk) {
                            yield chat_chunk;
                        }
                    }
                    Err(e) => {
                        debug!("Failed to parse OpenAI chunk: {}, data: {}", e, data);
                    }
                }
            }
        }
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
