//! 批处理调度器
//!
//! 固定数量的 worker 共享一个单元队列。每个单元依次经过：
//! 模板检查 → 缓存查询 → 生成锁 → 二次查询 → 读取源文件 → 渲染 → 分发与重试
//! → 写入存储 → 记录指纹。单元级错误在 worker 内转换为 Failed 结果，
//! 只有调用方取消或存储持续不可用才会提前结束批次。

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::{AbortReason, BatchRun, PriceTable, ResultAggregator};
use super::cache::FingerprintCache;
use super::dispatcher::{CallParams, Completion, DispatchError, Dispatcher};
use super::fingerprint::{prompt_hash, DocumentId, Fingerprint};
use super::progress::{NoopObserver, ProgressObserver};
use super::prompts::TemplateRegistry;
use super::retry::{Decision, RetryPolicy};
use super::store::{DocMetadata, DocumentStore, StoredDocument};
use super::types::{
    AttemptOutcome, AttemptRecord, GenerationRequest, Language, ModelConfig, SourceUnit,
    UnitOutcome,
};
use crate::error::{FailureKind, UnitError};
use crate::utils::AttemptLog;

/// 调度器配置与协作者；每次运行时复制一份交给 worker 共享
#[derive(Clone)]
struct SchedulerInner {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<FingerprintCache>,
    store: Arc<dyn DocumentStore>,
    templates: TemplateRegistry,
    retry: RetryPolicy,
    prices: PriceTable,
    template_version: String,
    store_outage_threshold: usize,
    observer: Arc<dyn ProgressObserver>,
    attempt_log: Option<Arc<AttemptLog>>,
}

/// 单次批处理的运行状态
struct RunContext {
    queue: Mutex<VecDeque<SourceUnit>>,
    model: ModelConfig,
    /// 调用方 token 的子 token；存储不可用时由调度器自行取消
    token: CancellationToken,
    consecutive_store_failures: AtomicUsize,
    store_unavailable: AtomicBool,
}

/// 批处理调度器
pub struct BatchScheduler {
    inner: SchedulerInner,
}

impl BatchScheduler {
    pub fn new(
        dispatcher: Dispatcher,
        cache: Arc<FingerprintCache>,
        store: Arc<dyn DocumentStore>,
        templates: TemplateRegistry,
    ) -> Self {
        Self {
            inner: SchedulerInner {
                dispatcher: Arc::new(dispatcher),
                cache,
                store,
                templates,
                retry: RetryPolicy::default(),
                prices: PriceTable::default(),
                template_version: "v1".to_string(),
                store_outage_threshold: 5,
                observer: Arc::new(NoopObserver),
                attempt_log: None,
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.inner.retry = retry;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.inner.prices = prices;
        self
    }

    /// 必须与扫描时使用的模板版本一致
    pub fn with_template_version(mut self, version: impl Into<String>) -> Self {
        self.inner.template_version = version.into();
        self
    }

    pub fn with_store_outage_threshold(mut self, threshold: usize) -> Self {
        self.inner.store_outage_threshold = threshold.max(1);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.inner.observer = observer;
        self
    }

    pub fn with_attempt_log(mut self, log: Arc<AttemptLog>) -> Self {
        self.inner.attempt_log = Some(log);
        self
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.inner.cache
    }

    /// 运行一个批次
    ///
    /// 每个被处理的单元恰好产生一个结果；取消后未处理的单元不产生结果，
    /// 报告中 `processed <= total`。
    pub async fn run(
        &self,
        units: Vec<SourceUnit>,
        concurrency: usize,
        model: &ModelConfig,
        cancel: CancellationToken,
    ) -> BatchRun {
        let inner = Arc::new(self.inner.clone());
        let total = units.len();
        let concurrency = concurrency.max(1).min(total.max(1));
        let aggregator = ResultAggregator::new(total, model.model.clone(), inner.prices.clone());

        info!(
            "Batch starting: {} units, {} workers, {} dispatch slots, model={}",
            total,
            concurrency,
            inner.dispatcher.limit(),
            model.model
        );
        inner.warn_missing_templates(&units, model);
        inner.observer.on_batch_started(total);

        let run = Arc::new(RunContext {
            queue: Mutex::new(units.into()),
            model: model.clone(),
            token: cancel.child_token(),
            consecutive_store_failures: AtomicUsize::new(0),
            store_unavailable: AtomicBool::new(false),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<UnitOutcome>();
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let inner = inner.clone();
            let run = run.clone();
            let tx = tx.clone();
            workers.spawn(async move { inner.worker_loop(worker_id, run, tx).await });
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            aggregator.record(&outcome);
            inner.observer.on_outcome(&outcome, &aggregator.snapshot());
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }

        let report = aggregator.finalize();
        let aborted = if run.store_unavailable.load(Ordering::SeqCst) {
            Some(AbortReason::StoreUnavailable)
        } else if cancel.is_cancelled() && report.processed < report.total {
            Some(AbortReason::Cancelled)
        } else {
            None
        };

        match aborted {
            Some(reason) => warn!(
                "Batch aborted ({}): {}/{} units processed",
                reason, report.processed, report.total
            ),
            None => info!(
                "Batch completed: {} succeeded, {} failed, {} skipped in {:.1}s",
                report.succeeded,
                report.failed,
                report.skipped,
                report.elapsed.as_secs_f64()
            ),
        }
        inner.observer.on_batch_finished(&report);

        BatchRun { report, aborted }
    }
}

impl SchedulerInner {
    /// 启动前检查本批次用到的 (语言, 格式) 组合，缺失的只提示一次
    fn warn_missing_templates(&self, units: &[SourceUnit], model: &ModelConfig) {
        let languages: BTreeSet<&Language> = units.iter().map(|u| &u.language).collect();
        let missing = self
            .templates
            .missing(languages.into_iter(), model.output_format);
        for language in missing {
            let affected = units.iter().filter(|u| u.language == language).count();
            warn!(
                "No template for ({}, {}): {} units will fail",
                language, model.output_format, affected
            );
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        run: Arc<RunContext>,
        tx: mpsc::UnboundedSender<UnitOutcome>,
    ) {
        debug!("Worker {} started", worker_id);
        loop {
            if run.token.is_cancelled() {
                break;
            }
            let Some(unit) = run.queue.lock().pop_front() else {
                break;
            };
            if let Some(outcome) = self.process_unit(unit, &run).await {
                if tx.send(outcome).is_err() {
                    break;
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    /// 处理单个单元；因取消而放弃时返回 None
    async fn process_unit(&self, unit: SourceUnit, run: &RunContext) -> Option<UnitOutcome> {
        let started = Instant::now();
        let format = run.model.output_format;

        if !self.templates.contains(&unit.language, format) {
            let error = UnitError::TemplateNotFound {
                language: unit.language.to_string(),
                format: format.to_string(),
            };
            return Some(UnitOutcome::failed(unit, error, 0, started.elapsed()));
        }

        if let Some(document_id) = self.cache.lookup(&unit.fingerprint) {
            debug!("Cache hit: {}", unit.path.display());
            return Some(UnitOutcome::skipped(unit, document_id, started.elapsed()));
        }

        let _guard = tokio::select! {
            biased;
            _ = run.token.cancelled() => return None,
            guard = self.cache.acquire(&unit.fingerprint) => guard,
        };

        // 等锁期间可能已由相同内容的单元生成
        if let Some(document_id) = self.cache.lookup(&unit.fingerprint) {
            debug!("Cache hit after wait: {}", unit.path.display());
            return Some(UnitOutcome::skipped(unit, document_id, started.elapsed()));
        }

        let content = match tokio::fs::read_to_string(&unit.path).await {
            Ok(content) => content,
            Err(e) => {
                let error = UnitError::SourceUnreadable {
                    path: unit.path.clone(),
                    reason: e.to_string(),
                };
                return Some(UnitOutcome::failed(unit, error, 0, started.elapsed()));
            }
        };
        let current = Fingerprint::compute(&self.template_version, &unit.language, format, &content);
        if current != unit.fingerprint {
            let error = UnitError::SourceChanged {
                path: unit.path.clone(),
            };
            return Some(UnitOutcome::failed(unit, error, 0, started.elapsed()));
        }

        let prompt = match self.templates.render(&unit.language, format, &content) {
            Ok(prompt) => prompt,
            Err(error) => return Some(UnitOutcome::failed(unit, error, 0, started.elapsed())),
        };

        let request = GenerationRequest::new(unit, &run.model);
        let params = CallParams::for_request(&request, &run.model);

        let (completion, attempts, generation_ms) =
            match self.generate(&request, &prompt, &params, run).await? {
                Ok(generated) => generated,
                Err((error, attempts)) => {
                    return Some(UnitOutcome::failed(request.unit, error, attempts, started.elapsed()))
                }
            };

        let document_id = DocumentId::derive(&request.unit.fingerprint, format);
        let document = StoredDocument {
            document_id: document_id.clone(),
            fingerprint: request.unit.fingerprint.clone(),
            file_path: request.unit.path.clone(),
            language: request.unit.language.clone(),
            output_format: format,
            content: completion.text,
            metadata: DocMetadata {
                model: request.model.clone(),
                prompt_tokens: completion.usage.prompt_tokens,
                completion_tokens: completion.usage.completion_tokens,
                generation_ms,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                prompt_hash: prompt_hash(&prompt),
                template_version: self.template_version.clone(),
                created_at: Utc::now(),
            },
        };

        // 先写文档再记录指纹：写入失败时缓存中不会出现该指纹
        if let Err(e) = self.store.put(&document).await {
            self.note_store_failure(run);
            error!("Failed to store document for {}: {}", request.unit.path.display(), e);
            let error = UnitError::StoreFailure {
                reason: e.to_string(),
            };
            return Some(UnitOutcome::failed(request.unit, error, attempts, started.elapsed()));
        }
        run.consecutive_store_failures.store(0, Ordering::SeqCst);

        if let Err(error) = self.cache.record(&request.unit.fingerprint, &document_id) {
            error!("{}", error);
            return Some(UnitOutcome::failed(request.unit, error, attempts, started.elapsed()));
        }

        Some(UnitOutcome::succeeded(
            request.unit,
            document_id,
            completion.usage,
            attempts,
            started.elapsed(),
        ))
    }

    /// 分发并按策略重试
    ///
    /// 外层 None 表示被取消；内层 Err 携带终止错误和已尝试次数。
    async fn generate(
        &self,
        request: &GenerationRequest,
        prompt: &str,
        params: &CallParams,
        run: &RunContext,
    ) -> Option<Result<(Completion, u32, u64), (UnitError, u32)>> {
        let path = &request.unit.path;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started_at = Utc::now();
            let call_start = Instant::now();

            let err = match self.dispatcher.dispatch(prompt, params, &run.token).await {
                Ok(completion) => {
                    let latency_ms = call_start.elapsed().as_millis() as u64;
                    self.log_attempt(
                        request,
                        attempt,
                        started_at,
                        AttemptOutcome::Success {
                            token_usage: completion.usage,
                            latency_ms,
                            response_chars: completion.text.chars().count(),
                        },
                    );
                    return Some(Ok((completion, attempt, latency_ms)));
                }
                Err(DispatchError::Cancelled) => {
                    debug!("Cancelled before dispatch: {}", path.display());
                    return None;
                }
                Err(DispatchError::Upstream(err)) => err,
            };

            self.log_attempt(
                request,
                attempt,
                started_at,
                AttemptOutcome::failure(err.kind, err.reason.clone()),
            );

            match self.retry.should_retry(attempt, err.kind) {
                Decision::GiveUp => {
                    let error = match err.kind {
                        FailureKind::Fatal => UnitError::Fatal { reason: err.reason },
                        FailureKind::Retryable => UnitError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.reason,
                        },
                    };
                    warn!("Giving up on {} after {} attempts: {}", path.display(), attempt, error);
                    return Some(Err((error, attempt)));
                }
                Decision::Retry(delay) => {
                    warn!(
                        "Attempt {} for {} failed ({}), retrying in {} ms",
                        attempt,
                        path.display(),
                        err.reason,
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = run.token.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn note_store_failure(&self, run: &RunContext) {
        let failures = run.consecutive_store_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.store_outage_threshold
            && !run.store_unavailable.swap(true, Ordering::SeqCst)
        {
            error!(
                "Document store failed {} times in a row, aborting batch",
                failures
            );
            run.token.cancel();
        }
    }

    fn log_attempt(
        &self,
        request: &GenerationRequest,
        attempt_number: u32,
        started_at: chrono::DateTime<Utc>,
        outcome: AttemptOutcome,
    ) {
        if let Some(log) = &self.attempt_log {
            log.append(&AttemptRecord {
                path: request.unit.path.clone(),
                model: request.model.clone(),
                attempt_number,
                started_at,
                outcome,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TokenUsage;
    use crate::services::batch::aggregator::{BatchProgress, BatchReport};
    use crate::services::batch::dispatcher::{Upstream, UpstreamError};
    use crate::services::batch::retry::RetryConfig;
    use crate::services::batch::store::{MemoryDocumentStore, StoreError};
    use crate::services::batch::types::{OutputFormat, UnitStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Step {
        Ok(u64, u64),
        Slow(Duration),
        Retryable,
        Fatal,
    }

    /// 按 prompt 中的标记返回预设结果；队列只剩一步时重复该步
    #[derive(Default)]
    struct ScriptedUpstream {
        plan: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: AtomicUsize,
        calls_by_marker: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedUpstream {
        fn script(&self, marker: &str, steps: Vec<Step>) {
            self.plan.lock().insert(marker.to_string(), steps.into());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn calls_for(&self, marker: &str) -> usize {
            self.calls_by_marker.lock().get(marker).copied().unwrap_or(0)
        }

        fn next_step(&self, prompt: &str) -> Step {
            let mut plan = self.plan.lock();
            let marker = plan.keys().find(|m| prompt.contains(m.as_str())).cloned();
            let Some(marker) = marker else {
                return Step::Ok(10, 5);
            };
            *self.calls_by_marker.lock().entry(marker.clone()).or_insert(0) += 1;
            let steps = plan.get_mut(&marker).unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap_or(Step::Ok(10, 5))
            }
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn call(&self, prompt: &str, _params: &CallParams) -> Result<Completion, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let completion = |p, c| Completion {
                text: "# Documentation".to_string(),
                usage: TokenUsage::new(p, c),
            };
            match self.next_step(prompt) {
                Step::Ok(p, c) => Ok(completion(p, c)),
                Step::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(completion(10, 5))
                }
                Step::Retryable => Err(UpstreamError::retryable("HTTP 503")),
                Step::Fatal => Err(UpstreamError::fatal("HTTP 401")),
            }
        }
    }

    /// 前 `fail_first` 次写入失败（`usize::MAX` 表示一直失败）
    struct FlakyStore {
        inner: MemoryDocumentStore,
        fail_first: usize,
        puts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_first: usize) -> Self {
            Self {
                inner: MemoryDocumentStore::new(),
                fail_first,
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn put(&self, document: &StoredDocument) -> Result<(), StoreError> {
            if self.puts.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(StoreError::Io(
                    PathBuf::from("documents"),
                    std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"),
                ));
            }
            self.inner.put(document).await
        }

        async fn get(&self, id: &DocumentId) -> Result<StoredDocument, StoreError> {
            self.inner.get(id).await
        }

        async fn exists(&self, id: &DocumentId) -> Result<bool, StoreError> {
            self.inner.exists(id).await
        }

        async fn list_by_path(&self, path: &Path) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.list_by_path(path).await
        }

        async fn delete(&self, id: &DocumentId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    #[derive(Default)]
    struct CollectingObserver {
        outcomes: Mutex<Vec<UnitOutcome>>,
    }

    impl ProgressObserver for CollectingObserver {
        fn on_outcome(&self, outcome: &UnitOutcome, _progress: &BatchProgress) {
            self.outcomes.lock().push(outcome.clone());
        }
    }

    impl CollectingObserver {
        fn find(&self, name: &str) -> UnitOutcome {
            self.outcomes
                .lock()
                .iter()
                .find(|o| o.unit.path.ends_with(name))
                .cloned()
                .unwrap()
        }
    }

    fn unit(dir: &Path, name: &str, content: &str) -> SourceUnit {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        SourceUnit::from_content(path.clone(), Language::from_path(&path), content, "v1", OutputFormat::Markdown)
    }

    fn model() -> ModelConfig {
        ModelConfig {
            timeout: Duration::from_secs(5),
            ..ModelConfig::default()
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
    }

    fn scheduler(
        upstream: Arc<ScriptedUpstream>,
        store: Arc<dyn DocumentStore>,
        dispatch_limit: usize,
    ) -> BatchScheduler {
        BatchScheduler::new(
            Dispatcher::new(upstream, dispatch_limit),
            Arc::new(FingerprintCache::new()),
            store,
            TemplateRegistry::builtin(),
        )
        .with_retry(fast_retry(30))
    }

    #[tokio::test]
    async fn test_duplicate_content_calls_upstream_once() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<dup>>", vec![Step::Slow(Duration::from_millis(30))]);
        let observer = Arc::new(CollectingObserver::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 4)
            .with_observer(observer.clone());

        let units = vec![
            unit(dir.path(), "a.py", "# <<dup>>"),
            unit(dir.path(), "b.py", "# <<dup>>"),
        ];
        let run = scheduler.run(units, 2, &model(), CancellationToken::new()).await;

        assert_eq!(upstream.calls(), 1);
        assert_eq!(run.report.succeeded, 1);
        assert_eq!(run.report.skipped, 1);
        let outcomes = observer.outcomes.lock().clone();
        assert_eq!(outcomes.len(), 2);
        let generated = outcomes.iter().find(|o| o.status == UnitStatus::Succeeded).unwrap();
        let skipped = outcomes.iter().find(|o| o.status == UnitStatus::Skipped).unwrap();
        assert_eq!(generated.document_id, skipped.document_id);
        assert!(skipped.token_usage.is_zero());
        assert_eq!(skipped.attempts, 0);
    }

    #[tokio::test]
    async fn test_mixed_batch_scenario() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<two>>", vec![Step::Retryable, Step::Retryable, Step::Ok(100, 50)]);
        upstream.script("<<three>>", vec![Step::Fatal]);
        let observer = Arc::new(CollectingObserver::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 2)
            .with_observer(observer.clone());

        let units = vec![
            unit(dir.path(), "one.py", "# <<one>>"),
            unit(dir.path(), "one_copy.py", "# <<one>>"),
            unit(dir.path(), "two.py", "# <<two>>"),
            unit(dir.path(), "three.py", "# <<three>>"),
        ];
        let run = scheduler.run(units, 4, &model(), CancellationToken::new()).await;
        let report = &run.report;

        assert!(run.aborted.is_none());
        assert_eq!(report.total, 4);
        assert_eq!((report.succeeded, report.failed, report.skipped), (2, 1, 1));
        assert_eq!(report.succeeded + report.failed + report.skipped, report.total);
        assert_eq!(report.total_tokens, 15 + 150);

        let two = observer.find("two.py");
        assert_eq!(two.status, UnitStatus::Succeeded);
        assert_eq!(two.attempts, 3);
        assert_eq!(two.token_usage, TokenUsage::new(100, 50));

        let three = observer.find("three.py");
        assert_eq!(three.attempts, 1);
        assert!(matches!(three.error, Some(UnitError::Fatal { .. })));
        assert_eq!(upstream.calls_for("<<three>>"), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<flaky>>", vec![Step::Retryable]);
        let observer = Arc::new(CollectingObserver::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 1)
            .with_retry(fast_retry(3))
            .with_observer(observer.clone());

        let run = scheduler
            .run(vec![unit(dir.path(), "f.py", "<<flaky>>")], 1, &model(), CancellationToken::new())
            .await;

        assert_eq!(run.report.failed, 1);
        assert_eq!(upstream.calls(), 3);
        assert_eq!(
            observer.find("f.py").error,
            Some(UnitError::RetriesExhausted {
                attempts: 3,
                last_error: "HTTP 503".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_store_failure_leaves_no_cache_entry() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(FlakyStore::new(1)), 1);
        let source = unit(dir.path(), "s.py", "x = 1");

        let first = scheduler
            .run(vec![source.clone()], 1, &model(), CancellationToken::new())
            .await;
        assert_eq!(first.report.failed, 1);
        assert_eq!(first.report.failures.get("store_failure"), Some(&1));
        assert!(first.aborted.is_none());
        assert_eq!(scheduler.cache().lookup(&source.fingerprint), None);

        let second = scheduler
            .run(vec![source.clone()], 1, &model(), CancellationToken::new())
            .await;
        assert_eq!(second.report.succeeded, 1);
        assert_eq!(upstream.calls(), 2);
        assert!(scheduler.cache().lookup(&source.fingerprint).is_some());
    }

    #[tokio::test]
    async fn test_store_outage_aborts_batch() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let scheduler = scheduler(upstream, Arc::new(FlakyStore::new(usize::MAX)), 1)
            .with_store_outage_threshold(3);

        let units: Vec<_> = (0..10)
            .map(|i| unit(dir.path(), &format!("u{i}.py"), &format!("x = {i}")))
            .collect();
        let run = scheduler.run(units, 1, &model(), CancellationToken::new()).await;

        assert_eq!(run.aborted, Some(AbortReason::StoreUnavailable));
        assert_eq!(run.report.failed, 3);
        assert_eq!(run.report.processed, 3);
        assert_eq!(run.report.total, 10);
    }

    #[tokio::test]
    async fn test_concurrency_does_not_change_totals() {
        async fn run_with(concurrency: usize) -> BatchReport {
            let dir = TempDir::new().unwrap();
            let upstream = Arc::new(ScriptedUpstream::default());
            for k in 0..150 {
                if k % 10 == 0 {
                    upstream.script(&format!("<<u{k}>>"), vec![Step::Fatal]);
                } else if k % 7 == 0 {
                    upstream.script(&format!("<<u{k}>>"), vec![Step::Retryable, Step::Ok(10, 5)]);
                }
            }
            let scheduler = scheduler(upstream, Arc::new(MemoryDocumentStore::new()), 8);
            let units: Vec<_> = (0..200)
                .map(|i| unit(dir.path(), &format!("f{i}.py"), &format!("# <<u{}>>", i % 150)))
                .collect();
            let mut report = scheduler
                .run(units, concurrency, &model(), CancellationToken::new())
                .await
                .report;
            report.elapsed = Duration::ZERO;
            report
        }

        let serial = run_with(1).await;
        let parallel = run_with(50).await;
        assert_eq!(serial, parallel);
        assert_eq!(serial.total, 200);
        assert_eq!((serial.succeeded, serial.failed, serial.skipped), (135, 20, 45));
        assert_eq!(serial.total_tokens, 135 * 15);
    }

    #[tokio::test]
    async fn test_missing_template_fails_without_dispatch() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let observer = Arc::new(CollectingObserver::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 1)
            .with_observer(observer.clone());

        let run = scheduler
            .run(vec![unit(dir.path(), "init.lua", "x = 1")], 1, &model(), CancellationToken::new())
            .await;

        assert_eq!(run.report.failed, 1);
        assert_eq!(upstream.calls(), 0);
        assert!(matches!(
            observer.find("init.lua").error,
            Some(UnitError::TemplateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_changed_source_is_not_generated() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let observer = Arc::new(CollectingObserver::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 1)
            .with_observer(observer.clone());

        let source = unit(dir.path(), "m.py", "x = 1");
        std::fs::write(&source.path, "x = 2").unwrap();
        let run = scheduler.run(vec![source], 1, &model(), CancellationToken::new()).await;

        assert_eq!(run.report.failed, 1);
        assert_eq!(upstream.calls(), 0);
        assert!(matches!(
            observer.find("m.py").error,
            Some(UnitError::SourceChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 2);
        let units: Vec<_> = (0..5)
            .map(|i| unit(dir.path(), &format!("c{i}.py"), &format!("x = {i}")))
            .collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = scheduler.run(units, 2, &model(), cancel).await;

        assert_eq!(run.aborted, Some(AbortReason::Cancelled));
        assert_eq!(run.report.processed, 0);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_returns_partial_report() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        for i in 0..40 {
            upstream.script(&format!("<<slow{i}>>"), vec![Step::Slow(Duration::from_millis(50))]);
        }
        let scheduler = Arc::new(scheduler(upstream, Arc::new(MemoryDocumentStore::new()), 2));
        let units: Vec<_> = (0..40)
            .map(|i| unit(dir.path(), &format!("s{i}.py"), &format!("# <<slow{i}>>")))
            .collect();

        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(units, 4, &model(), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        let run = handle.await.unwrap();

        let report = &run.report;
        assert_eq!(run.aborted, Some(AbortReason::Cancelled));
        assert!(report.processed < report.total);
        assert_eq!(report.succeeded + report.failed + report.skipped, report.processed);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_every_attempt_is_logged() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AttemptLog::new(dir.path().join("attempts.jsonl"), 100));
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<two>>", vec![Step::Retryable, Step::Ok(1, 1)]);
        let scheduler = scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 1)
            .with_attempt_log(log.clone());

        let units = vec![unit(dir.path(), "one.py", "x"), unit(dir.path(), "two.py", "<<two>>")];
        scheduler.run(units, 1, &model(), CancellationToken::new()).await;

        let records = log.tail(usize::MAX);
        assert_eq!(records.len(), upstream.calls());
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .any(|r| matches!(r.outcome, AttemptOutcome::RetryableFailure { .. })));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_backoff() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<down>>", vec![Step::Retryable]);
        let scheduler = Arc::new(
            scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 1).with_retry(
                RetryPolicy::new(RetryConfig {
                    max_attempts: 5,
                    base_delay_ms: 10_000,
                    max_delay_ms: 10_000,
                }),
            ),
        );

        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            let units = vec![unit(dir.path(), "down.py", "<<down>>")];
            tokio::spawn(async move { scheduler.run(units, 1, &model(), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // 退避至少 5 秒；取消后应立即返回
        let run = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("backoff was not interrupted")
            .unwrap();
        assert_eq!(run.aborted, Some(AbortReason::Cancelled));
        assert_eq!(run.report.processed, 0);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_generation_lock_waiter() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.script("<<same>>", vec![Step::Slow(Duration::from_millis(300))]);
        let scheduler = Arc::new(scheduler(upstream.clone(), Arc::new(MemoryDocumentStore::new()), 2));

        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            let units = vec![
                unit(dir.path(), "first.py", "# <<same>>"),
                unit(dir.path(), "second.py", "# <<same>>"),
            ];
            tokio::spawn(async move { scheduler.run(units, 2, &model(), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let run = handle.await.unwrap();

        // 持有锁的单元完成在途调用，等锁的单元被放弃
        assert_eq!(upstream.calls(), 1);
        assert_eq!(run.aborted, Some(AbortReason::Cancelled));
        assert_eq!(run.report.processed, 1);
        assert_eq!(run.report.succeeded, 1);
        assert!(run.report.processed < run.report.total);
    }

    #[tokio::test]
    async fn test_run_batch_without_cancellation() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(ScriptedUpstream::default());
        let store = Arc::new(MemoryDocumentStore::new());
        let scheduler = scheduler(upstream.clone(), store.clone(), 2);
        let units = vec![
            unit(dir.path(), "a.rs", "fn a() {}"),
            unit(dir.path(), "b.rs", "fn b() {}"),
            unit(dir.path(), "c.rs", "fn a() {}"),
        ];

        let run = crate::services::batch::run_batch(&scheduler, units, 3, &model()).await;

        assert!(run.aborted.is_none());
        assert_eq!(run.report.processed, run.report.total);
        assert_eq!((run.report.succeeded, run.report.skipped), (2, 1));
        assert_eq!(upstream.calls(), 2);
        assert_eq!(store.len(), 2);
    }
}
