//! 结果汇总
//!
//! 把各 worker 的 UnitOutcome 折叠为批次统计。只做可交换、可结合的累加，
//! 成本在 finalize 时由累计 token 一次性计算，因此与到达顺序无关。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use uuid::Uuid;

use super::types::{UnitOutcome, UnitStatus};
use crate::error::AppError;
use crate::llm::TokenUsage;

/// 模型价格（美元 / 1K token）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.input_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

/// 成本估算
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    /// 美元
    Known(f64),
    /// 价格表中没有该模型
    Unknown,
}

impl Cost {
    pub fn usd(&self) -> Option<f64> {
        match self {
            Cost::Known(usd) => Some(*usd),
            Cost::Unknown => None,
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cost::Known(usd) => write!(f, "${:.4}", usd),
            Cost::Unknown => f.write_str("unknown"),
        }
    }
}

/// 价格表
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }

    /// 精确匹配优先，否则取最长的前缀匹配（`gpt-4o-2024-08-06` → `gpt-4o`）
    pub fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(price);
        }
        self.prices
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| price)
    }

    pub fn estimate(&self, model: &str, usage: &TokenUsage) -> Cost {
        if usage.is_zero() {
            return Cost::Known(0.0);
        }
        match self.lookup(model) {
            Some(price) => Cost::Known(price.cost(usage)),
            None => Cost::Unknown,
        }
    }
}

/// 批次中止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// 调用方取消
    Cancelled,
    /// 文档存储连续失败
    StoreUnavailable,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::StoreUnavailable => f.write_str("store unavailable"),
        }
    }
}

/// 批次报告（finalize 后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 提交的单元数
    pub total: usize,
    /// 已产生结果的单元数
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: Cost,
    /// 失败按类别计数
    pub failures: BTreeMap<String, usize>,
    pub elapsed: Duration,
}

/// 运行中的进度快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_tokens: u64,
}

impl BatchProgress {
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f32 / self.total as f32 * 100.0
    }
}

#[derive(Debug, Default)]
struct Totals {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    usage: TokenUsage,
    failures: BTreeMap<String, usize>,
}

impl Totals {
    fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// 结果汇总器
pub struct ResultAggregator {
    totals: Mutex<Totals>,
    total: usize,
    model: String,
    prices: PriceTable,
    started: Instant,
}

impl ResultAggregator {
    pub fn new(total: usize, model: impl Into<String>, prices: PriceTable) -> Self {
        Self {
            totals: Mutex::new(Totals::default()),
            total,
            model: model.into(),
            prices,
            started: Instant::now(),
        }
    }

    /// 记录一个单元结果，可从任意线程并发调用
    pub fn record(&self, outcome: &UnitOutcome) {
        let mut totals = self.totals.lock();
        match outcome.status {
            UnitStatus::Succeeded => totals.succeeded += 1,
            UnitStatus::Skipped => totals.skipped += 1,
            UnitStatus::Failed => {
                totals.failed += 1;
                let label = outcome.error.as_ref().map(|e| e.label()).unwrap_or("unknown");
                *totals.failures.entry(label.to_string()).or_insert(0) += 1;
            }
        }
        totals.usage.add(outcome.token_usage);
    }

    pub fn snapshot(&self) -> BatchProgress {
        let totals = self.totals.lock();
        BatchProgress {
            total: self.total,
            processed: totals.processed(),
            succeeded: totals.succeeded,
            failed: totals.failed,
            skipped: totals.skipped,
            total_tokens: totals.usage.total(),
        }
    }

    /// 生成最终报告；消费自身，保证只调用一次
    pub fn finalize(self) -> BatchReport {
        let elapsed = self.started.elapsed();
        let totals = self.totals.into_inner();
        BatchReport {
            total: self.total,
            processed: totals.processed(),
            succeeded: totals.succeeded,
            failed: totals.failed,
            skipped: totals.skipped,
            prompt_tokens: totals.usage.prompt_tokens,
            completion_tokens: totals.usage.completion_tokens,
            total_tokens: totals.usage.total(),
            estimated_cost: self.prices.estimate(&self.model, &totals.usage),
            failures: totals.failures,
            elapsed,
        }
    }
}

/// 一次批处理的结果
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub report: BatchReport,
    /// 提前结束时的原因
    pub aborted: Option<AbortReason>,
}

/// 持久化的批次汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub model: String,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_tokens: u64,
    /// 美元；价格未知时为 null
    pub estimated_cost: Option<f64>,
    pub elapsed_seconds: f64,
    pub aborted: Option<AbortReason>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    pub fn new(run: &BatchRun, model: impl Into<String>) -> Self {
        let report = &run.report;
        Self {
            batch_id: Uuid::new_v4().to_string(),
            model: model.into(),
            total: report.total,
            processed: report.processed,
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            total_tokens: report.total_tokens,
            estimated_cost: report.estimated_cost.usd(),
            elapsed_seconds: report.elapsed.as_secs_f64(),
            aborted: run.aborted,
            finished_at: Utc::now(),
        }
    }

    /// 写入 `dir/<时间>-<id>.json`，返回文件路径
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, AppError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::Io(dir.to_path_buf(), e))?;
        let name = format!(
            "{}-{}.json",
            self.finished_at.format("%Y%m%d-%H%M%S"),
            &self.batch_id[..8]
        );
        let path = dir.join(name);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("序列化批次汇总失败: {}", e)))?;
        fs::write(&path, content)
            .await
            .map_err(|e| AppError::Io(path.clone(), e))?;
        Ok(path)
    }
}
