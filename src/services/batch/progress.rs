//! 进度观察者
//!
//! 调度器每产生一个 UnitOutcome 调用一次观察者。观察者只用于展示，
//! 不影响批处理的正确性。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::aggregator::{BatchProgress, BatchReport};
use super::types::{UnitOutcome, UnitStatus};

/// 进度观察者
pub trait ProgressObserver: Send + Sync {
    fn on_batch_started(&self, _total: usize) {}

    fn on_outcome(&self, _outcome: &UnitOutcome, _progress: &BatchProgress) {}

    fn on_batch_finished(&self, _report: &BatchReport) {}
}

/// 不做任何事
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// 以日志形式输出进度
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_batch_started(&self, total: usize) {
        info!("Batch started: {} units", total);
    }

    fn on_outcome(&self, outcome: &UnitOutcome, progress: &BatchProgress) {
        let path = outcome.unit.path.display();
        match (&outcome.status, &outcome.error) {
            (UnitStatus::Failed, Some(error)) => warn!(
                "[{}/{}] failed {}: {}",
                progress.processed, progress.total, path, error
            ),
            (status, _) => info!(
                "[{}/{}] {:?} {} ({} tokens, {} ms)",
                progress.processed,
                progress.total,
                status,
                path,
                outcome.token_usage.total(),
                outcome.duration.as_millis()
            ),
        }
    }

    fn on_batch_finished(&self, report: &BatchReport) {
        info!(
            "Batch finished: {} succeeded, {} failed, {} skipped, {} tokens, cost {}",
            report.succeeded, report.failed, report.skipped, report.total_tokens, report.estimated_cost
        );
    }
}

/// 广播的批处理事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        total: usize,
    },
    UnitCompleted {
        path: PathBuf,
        status: UnitStatus,
        progress: BatchProgress,
    },
    Finished {
        report: BatchReport,
    },
}

/// 通过广播通道转发事件
pub struct BroadcastObserver {
    tx: broadcast::Sender<BatchEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<BatchEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressObserver for BroadcastObserver {
    // 没有订阅者时发送失败，忽略即可
    fn on_batch_started(&self, total: usize) {
        let _ = self.tx.send(BatchEvent::Started { total });
    }

    fn on_outcome(&self, outcome: &UnitOutcome, progress: &BatchProgress) {
        let _ = self.tx.send(BatchEvent::UnitCompleted {
            path: outcome.unit.path.clone(),
            status: outcome.status,
            progress: *progress,
        });
    }

    fn on_batch_finished(&self, report: &BatchReport) {
        let _ = self.tx.send(BatchEvent::Finished {
            report: report.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::batch::aggregator::{PriceTable, ResultAggregator};
    use crate::services::batch::fingerprint::DocumentId;
    use crate::services::batch::types::{Language, OutputFormat, SourceUnit};
    use std::time::Duration;

    #[tokio::test]
    async fn test_broadcast_observer_forwards_events() {
        let (observer, mut rx) = BroadcastObserver::new(16);
        let aggregator = ResultAggregator::new(1, "gpt-4o", PriceTable::default());
        let unit = SourceUnit::from_content("a.go", Language::Go, "package a", "v1", OutputFormat::Markdown);
        let outcome = UnitOutcome::skipped(unit, DocumentId::parse("0a").unwrap(), Duration::ZERO);

        observer.on_batch_started(1);
        aggregator.record(&outcome);
        observer.on_outcome(&outcome, &aggregator.snapshot());
        observer.on_batch_finished(&aggregator.finalize());

        assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Started { total: 1 }));
        match rx.recv().await.unwrap() {
            BatchEvent::UnitCompleted { status, progress, .. } => {
                assert_eq!(status, UnitStatus::Skipped);
                assert_eq!(progress.processed, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            BatchEvent::Finished { report } => assert_eq!(report.skipped, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(BatchEvent::Started { total: 3 }).unwrap();
        assert_eq!(json["type"], "started");
        assert_eq!(json["total"], 3);
    }
}
