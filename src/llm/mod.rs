//! LLM 模块
//!
//! 提供统一的 LLM 客户端，支持 OpenAI 和 Anthropic API 格式，
//! 并实现批处理管线所需的 [`Upstream`](crate::services::batch::Upstream) 接口。

mod anthropic;
mod client;
mod format;
mod openai;
mod types;

pub use client::LlmClient;
pub use format::{fix_base_url, ApiFormat};
pub use types::*;
