//! 指纹缓存
//!
//! 内容指纹 → 已生成文档的映射，决定单元是否可以直接跳过。
//! 同一指纹的生成由每指纹一把的生成锁串行化：第一个调用者生成并记录，
//! 其余调用者在锁上等待，拿到锁后重新查询即可命中缓存。

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::fingerprint::{DocumentId, Fingerprint};
use super::store::{DocumentStore, StoreError};
use crate::error::UnitError;

/// 缓存错误
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO 错误 ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("指纹索引解析失败: {0}")]
    Parse(String),

    #[error("指纹索引序列化失败: {0}")]
    Serialize(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 缓存条目：写入后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub fingerprint: Fingerprint,
    pub document_id: DocumentId,
    pub created_at: DateTime<Utc>,
}

/// 持久化格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct FingerprintIndex {
    entries: Vec<CachedDocument>,
}

type LockMap = DashMap<Fingerprint, Arc<Mutex<()>>>;

/// 指纹缓存
#[derive(Default)]
pub struct FingerprintCache {
    entries: DashMap<Fingerprint, CachedDocument>,
    locks: Arc<LockMap>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询指纹对应的文档
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<DocumentId> {
        self.entries
            .get(fingerprint)
            .map(|entry| entry.document_id.clone())
    }

    /// 记录指纹
    ///
    /// 相同的 (指纹, 文档) 重复记录是空操作；同一指纹记录不同文档返回
    /// `ConsistencyViolation`，原条目保持不变。
    pub fn record(&self, fingerprint: &Fingerprint, document_id: &DocumentId) -> Result<(), UnitError> {
        match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(existing) => {
                if &existing.get().document_id == document_id {
                    Ok(())
                } else {
                    Err(UnitError::ConsistencyViolation {
                        fingerprint: fingerprint.to_string(),
                        existing: existing.get().document_id.to_string(),
                        attempted: document_id.to_string(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(CachedDocument {
                    fingerprint: fingerprint.clone(),
                    document_id: document_id.clone(),
                    created_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// 获取指纹的生成锁
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> GenerationGuard {
        let lock = self
            .locks
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        GenerationGuard {
            guard: Some(guard),
            fingerprint: fingerprint.clone(),
            locks: self.locks.clone(),
        }
    }

    /// 删除指向某文档的所有条目，返回删除数量
    pub fn forget_document(&self, document_id: &DocumentId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| &entry.document_id != document_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 当前存活的生成锁数量
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// 从索引文件加载；文件不存在时返回空缓存
    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let cache = Self::new();
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!("Fingerprint index does not exist: {}", path.display());
            return Ok(cache);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::Io(path.to_path_buf(), e))?;
        let index: FingerprintIndex =
            serde_json::from_str(&content).map_err(|e| CacheError::Parse(e.to_string()))?;

        for entry in index.entries {
            cache.entries.insert(entry.fingerprint.clone(), entry);
        }
        info!("Fingerprint index loaded: {} entries", cache.len());
        Ok(cache)
    }

    /// 保存到索引文件（临时文件 + 重命名）
    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let mut entries: Vec<CachedDocument> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        let content = serde_json::to_string_pretty(&FingerprintIndex { entries })
            .map_err(|e| CacheError::Serialize(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Io(parent.to_path_buf(), e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| CacheError::Io(tmp.clone(), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| CacheError::Io(path.to_path_buf(), e))?;

        debug!("Fingerprint index saved: {} entries", self.len());
        Ok(())
    }

    /// 删除文档已不存在的条目，返回删除数量
    pub async fn prune_missing(&self, store: &dyn DocumentStore) -> Result<usize, CacheError> {
        let candidates: Vec<(Fingerprint, DocumentId)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.document_id.clone()))
            .collect();

        let mut pruned = 0;
        for (fingerprint, document_id) in candidates {
            if !store.exists(&document_id).await? {
                self.entries.remove(&fingerprint);
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!("Pruned {} fingerprint entries with missing documents", pruned);
        }
        Ok(pruned)
    }
}

/// 生成锁守卫
///
/// 释放时若没有其他等待者，则从锁表中移除该指纹的锁。
pub struct GenerationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    fingerprint: Fingerprint,
    locks: Arc<LockMap>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.fingerprint, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::batch::store::tests::sample_doc;
    use crate::services::batch::store::MemoryDocumentStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s)
    }

    fn id(s: &str) -> DocumentId {
        DocumentId::parse(s).unwrap()
    }

    #[test]
    fn test_record_is_idempotent() {
        let cache = FingerprintCache::new();
        assert_eq!(cache.lookup(&fp("aa")), None);
        cache.record(&fp("aa"), &id("01")).unwrap();
        cache.record(&fp("aa"), &id("01")).unwrap();
        assert_eq!(cache.lookup(&fp("aa")), Some(id("01")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_conflicting_record_is_rejected() {
        let cache = FingerprintCache::new();
        cache.record(&fp("aa"), &id("01")).unwrap();
        let err = cache.record(&fp("aa"), &id("02")).unwrap_err();
        assert!(matches!(err, UnitError::ConsistencyViolation { .. }));
        assert_eq!(cache.lookup(&fp("aa")), Some(id("01")));
    }

    #[tokio::test]
    async fn test_waiter_observes_first_callers_record() {
        let cache = Arc::new(FingerprintCache::new());
        let first = cache.acquire(&fp("bb")).await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let _guard = cache.acquire(&fp("bb")).await;
                cache.lookup(&fp("bb"))
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cache.record(&fp("bb"), &id("0b")).unwrap();
        drop(first);

        assert_eq!(waiter.await.unwrap(), Some(id("0b")));
        assert_eq!(cache.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_block() {
        let cache = FingerprintCache::new();
        let _a = cache.acquire(&fp("aa")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), cache.acquire(&fp("bb"))).await;
        assert!(b.is_ok());
        assert_eq!(cache.lock_count(), 2);
    }

    #[tokio::test]
    async fn test_save_load_and_prune() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fingerprints.json");
        let store = MemoryDocumentStore::new();

        let kept = sample_doc("a.rs", "kept", Utc::now());
        store.put(&kept).await.unwrap();

        let cache = FingerprintCache::new();
        cache.record(&kept.fingerprint, &kept.document_id).unwrap();
        cache.record(&fp("dead"), &id("0d")).unwrap();
        cache.save(&path).await.unwrap();

        let loaded = FingerprintCache::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);

        let pruned = loaded.prune_missing(&store).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(loaded.lookup(&kept.fingerprint), Some(kept.document_id.clone()));
        assert_eq!(loaded.lookup(&fp("dead")), None);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = FingerprintCache::load(&dir.path().join("none.json")).await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forget_document() {
        let cache = FingerprintCache::new();
        cache.record(&fp("aa"), &id("01")).unwrap();
        cache.record(&fp("bb"), &id("02")).unwrap();
        assert_eq!(cache.forget_document(&id("01")), 1);
        assert_eq!(cache.lookup(&fp("aa")), None);
        assert_eq!(cache.len(), 1);
    }
}
