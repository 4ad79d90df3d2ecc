//! 限流分发器
//!
//! 用计数信号量限制同时在途的上游请求数，与 worker 数量无关。
//! 获取分发槽是唯一与上游容量相关的挂起点；持有槽的调用受单次超时约束。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FailureKind;
use crate::llm::TokenUsage;

use super::types::{GenerationRequest, ModelConfig};

/// 单次上游调用参数
#[derive(Debug, Clone)]
pub struct CallParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl CallParams {
    pub fn for_request(request: &GenerationRequest, config: &ModelConfig) -> Self {
        Self {
            model: request.model.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            timeout: config.timeout,
        }
    }
}

/// 上游返回的完整响应
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// 已分类的上游错误
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct UpstreamError {
    pub kind: FailureKind,
    pub reason: String,
}

impl UpstreamError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Retryable, reason)
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, reason)
    }
}

/// 上游服务：一次请求/响应交换
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, prompt: &str, params: &CallParams) -> Result<Completion, UpstreamError>;
}

/// 分发错误
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// 等待分发槽期间批次被取消，未发出请求
    #[error("cancelled before dispatch")]
    Cancelled,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// 限流分发器
pub struct Dispatcher {
    upstream: Arc<dyn Upstream>,
    slots: Arc<Semaphore>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(upstream: Arc<dyn Upstream>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            upstream,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前在途请求数
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// 分发一次调用
    ///
    /// 取消只在等待槽时生效；拿到槽之后的调用总是执行完毕或超时。
    /// 超时按可重试处理，返回时槽已释放。
    pub async fn dispatch(
        &self,
        prompt: &str,
        params: &CallParams,
        cancel: &CancellationToken,
    ) -> Result<Completion, DispatchError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            permit = self.slots.acquire() => permit.map_err(|_| DispatchError::Cancelled)?,
        };

        match tokio::time::timeout(params.timeout, self.upstream.call(prompt, params)).await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => {
                debug!("Upstream call timed out after {:?}", params.timeout);
                Err(DispatchError::Upstream(UpstreamError::retryable(format!(
                    "request timed out after {}s",
                    params.timeout.as_secs_f64()
                ))))
            }
        }
    }
}
