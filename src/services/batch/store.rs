//! 文档存储
//!
//! 文档以 document_id 为键保存。文件系统实现每个文档一个 JSON 文件，
//! 先写临时文件再重命名，保证写入返回时文档已完整落盘。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use super::fingerprint::{DocumentId, Fingerprint};
use super::types::{Language, OutputFormat};

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("文档不存在: {0}")]
    NotFound(DocumentId),

    #[error("IO 错误 ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("序列化失败: {0}")]
    Serialize(String),

    #[error("文档文件损坏 ({0}): {1}")]
    Corrupt(PathBuf, String),
}

/// 文档元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// 成功那次调用的耗时（毫秒）
    pub generation_ms: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    /// prompt 文本的 sha256 前缀
    pub prompt_hash: String,
    pub template_version: String,
    pub created_at: DateTime<Utc>,
}

/// 已存储的文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document_id: DocumentId,
    pub fingerprint: Fingerprint,
    pub file_path: PathBuf,
    pub language: Language,
    pub output_format: OutputFormat,
    pub content: String,
    pub metadata: DocMetadata,
}

/// 文档存储接口
///
/// 实现需自行保证写入串行化；`put` 返回 `Ok` 即表示文档已持久化。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, document: &StoredDocument) -> Result<(), StoreError>;

    async fn get(&self, id: &DocumentId) -> Result<StoredDocument, StoreError>;

    async fn exists(&self, id: &DocumentId) -> Result<bool, StoreError>;

    /// 某个源文件的所有文档，按创建时间从新到旧
    async fn list_by_path(&self, path: &Path) -> Result<Vec<StoredDocument>, StoreError>;

    /// 删除文档，返回是否存在过
    async fn delete(&self, id: &DocumentId) -> Result<bool, StoreError>;
}

/// 文件系统存储
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// 创建存储并确保目录存在
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Io(root.clone(), e))?;
        Ok(Self { root })
    }

    fn doc_path(&self, id: &DocumentId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn read_doc(path: &Path) -> Result<StoredDocument, StoreError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(path.to_path_buf(), e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put(&self, document: &StoredDocument) -> Result<(), StoreError> {
        let path = self.doc_path(&document.document_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::Io(tmp.clone(), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        debug!("Document saved: {}", path.display());
        Ok(())
    }

    async fn get(&self, id: &DocumentId) -> Result<StoredDocument, StoreError> {
        let path = self.doc_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::NotFound(id.clone()));
        }
        Self::read_doc(&path).await
    }

    async fn exists(&self, id: &DocumentId) -> Result<bool, StoreError> {
        let path = self.doc_path(id);
        fs::try_exists(&path).await.map_err(|e| StoreError::Io(path, e))
    }

    async fn list_by_path(&self, path: &Path) -> Result<Vec<StoredDocument>, StoreError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::Io(self.root.clone(), e))?;

        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(self.root.clone(), e))?
        {
            let entry_path = entry.path();
            if entry_path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_doc(&entry_path).await {
                Ok(doc) if doc.file_path == path => docs.push(doc),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable document: {}", e),
            }
        }

        docs.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(docs)
    }

    async fn delete(&self, id: &DocumentId) -> Result<bool, StoreError> {
        let path = self.doc_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(path, e)),
        }
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, document: &StoredDocument) -> Result<(), StoreError> {
        self.docs
            .lock()
            .insert(document.document_id.clone(), document.clone());
        Ok(())
    }

    async fn get(&self, id: &DocumentId) -> Result<StoredDocument, StoreError> {
        self.docs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &DocumentId) -> Result<bool, StoreError> {
        Ok(self.docs.lock().contains_key(id))
    }

    async fn list_by_path(&self, path: &Path) -> Result<Vec<StoredDocument>, StoreError> {
        let mut docs: Vec<StoredDocument> = self
            .docs
            .lock()
            .values()
            .filter(|doc| doc.file_path == path)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(docs)
    }

    async fn delete(&self, id: &DocumentId) -> Result<bool, StoreError> {
        Ok(self.docs.lock().remove(id).is_some())
    }
}
