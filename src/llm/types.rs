//! LLM 类型定义

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// 聊天消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// 角色：system, user, assistant
    pub role: String,
    /// 消息内容
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// 输入 token
    pub prompt_tokens: u64,
    /// 输出 token
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// 总 token 数
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// 累加
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// 服务商未返回用量时的粗略估算（按空白分词）
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// 流式响应块
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    /// 文本内容
    pub content: Option<String>,
    /// 完成原因
    pub finish_reason: Option<String>,
    /// 用量（通常只出现在最后一个块）
    pub usage: Option<TokenUsage>,
}

/// 聊天选项
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// 温度参数
    pub temperature: Option<f64>,
    /// 最大 token 数
    pub max_tokens: Option<u32>,
}

/// 流式收集结果
#[derive(Debug, Clone, Default)]
pub struct StreamCollectResult {
    /// 完整响应内容
    pub content: String,
    /// 完成原因
    pub finish_reason: Option<String>,
    /// chunk 数量
    pub chunk_count: usize,
    /// 服务商报告的用量（可能部分缺失）
    pub usage: Option<TokenUsage>,
}

/// LLM 错误类型
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP 请求错误
    #[error("HTTP 请求失败: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API 返回错误
    #[error("API 错误 ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// JSON 解析错误
    #[error("JSON 解析失败: {0}")]
    JsonError(#[from] serde_json::Error),

    /// 流解析错误
    #[error("流解析错误: {0}")]
    StreamError(String),
}

impl LlmError {
    /// 对错误进行分类：是否值得重试
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            LlmError::HttpError(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
                    FailureKind::Retryable
                } else if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    FailureKind::Retryable
                }
            }
            LlmError::ApiError { status, .. } => classify_status(*status),
            LlmError::StreamError(_) => FailureKind::Retryable,
            LlmError::ConfigError(_) | LlmError::JsonError(_) => FailureKind::Fatal,
        }
    }
}

/// 按 HTTP 状态码分类
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 409 | 425 | 429 => FailureKind::Retryable,
        500..=599 => FailureKind::Retryable,
        _ => FailureKind::Fatal,
    }
}
