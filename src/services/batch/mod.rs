//! 批量文档生成管线
//!
//! 将扫描得到的源文件分发给 worker 池，经指纹缓存去重、限流分发、
//! 重试后写入文档存储，并汇总为批次报告。

pub mod aggregator;
pub mod cache;
pub mod dispatcher;
pub mod fingerprint;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod store;
pub mod types;

use tokio_util::sync::CancellationToken;

pub use aggregator::{
    AbortReason, BatchProgress, BatchReport, BatchRun, BatchSummary, Cost, ModelPrice, PriceTable,
    ResultAggregator,
};
pub use cache::{CacheError, CachedDocument, FingerprintCache};
pub use dispatcher::{CallParams, Completion, DispatchError, Dispatcher, Upstream, UpstreamError};
pub use fingerprint::{DocumentId, Fingerprint};
pub use progress::{BatchEvent, BroadcastObserver, LogObserver, NoopObserver, ProgressObserver};
pub use prompts::{TemplateError, TemplateOverride, TemplateRegistry};
pub use retry::{Decision, RetryConfig, RetryPolicy};
pub use scanner::{ScanError, ScanOptions, WorkspaceScanner};
pub use scheduler::BatchScheduler;
pub use store::{DocMetadata, DocumentStore, FsDocumentStore, MemoryDocumentStore, StoreError, StoredDocument};
pub use types::{
    AttemptOutcome, AttemptRecord, GenerationRequest, Language, ModelConfig, OutputFormat,
    SourceUnit, UnitOutcome, UnitStatus,
};

/// 运行一个不可取消的批次
pub async fn run_batch(
    scheduler: &BatchScheduler,
    units: Vec<SourceUnit>,
    concurrency: usize,
    model_config: &ModelConfig,
) -> BatchRun {
    scheduler
        .run(units, concurrency, model_config, CancellationToken::new())
        .await
}
