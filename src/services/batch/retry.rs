//! 重试策略
//!
//! 无状态：决策只依赖尝试序号和失败类型，可在所有 worker 间共享。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::FailureKind;

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 每个单元最多调用上游的次数（含第一次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 退避上限（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    30
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 等待后重试
    Retry(Duration),
    /// 放弃
    GiveUp,
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 第 `attempt` 次尝试（从 1 开始）失败后是否重试
    pub fn should_retry(&self, attempt: u32, kind: FailureKind) -> Decision {
        if kind == FailureKind::Fatal || attempt >= self.config.max_attempts {
            return Decision::GiveUp;
        }
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Decision::Retry(self.delay_with_jitter(attempt, jitter))
    }

    /// 未加抖动的退避：min(base * 2^(attempt-1), cap)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let millis = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// 给定抖动系数（0.5..=1.0）的退避
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        self.base_delay(attempt).mul_f64(jitter.clamp(0.5, 1.0))
    }

    /// 第 `attempt` 次失败后退避的取值范围
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt);
        (base / 2, base)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        })
    }

    #[test]
    fn test_fatal_never_retries() {
        let policy = policy(30);
        assert_eq!(policy.should_retry(1, FailureKind::Fatal), Decision::GiveUp);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = policy(5);
        let mut calls = 1;
        while let Decision::Retry(_) = policy.should_retry(calls, FailureKind::Retryable) {
            calls += 1;
        }
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_delays_stay_within_bounds() {
        let policy = policy(30);
        for attempt in 1..30 {
            let (low, high) = policy.delay_bounds(attempt);
            for _ in 0..20 {
                match policy.should_retry(attempt, FailureKind::Retryable) {
                    Decision::Retry(delay) => {
                        assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
                    }
                    Decision::GiveUp => panic!("gave up early at {attempt}"),
                }
            }
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = policy(30);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(6), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay(200), Duration::from_millis(2_000));
        assert_eq!(policy.delay_with_jitter(2, 0.5), Duration::from_millis(100));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: RetryConfig = serde_json::from_str(r#"{ "max_attempts": 3 }"#).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
    }
}
