//! 统一错误处理模块
//!
//! 定义应用级错误类型，以及批处理中单个文件（unit）的失败分类。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// 失败类型：在调度边界上对上游错误进行分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 可重试（超时、429/5xx、连接重置）
    Retryable,
    /// 不可重试（请求格式错误、鉴权失败、内容被拒绝）
    Fatal,
}

/// 单个文件处理失败的原因
///
/// 所有单元级错误都在 worker 边界被捕获并转换为 `Failed` 结果，不会中止整个批次。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    /// 没有对应 (language, format) 的模板
    #[error("模板不存在: language={language}, format={format}")]
    TemplateNotFound { language: String, format: String },

    /// 上游返回不可重试错误
    #[error("上游致命错误: {reason}")]
    Fatal { reason: String },

    /// 重试次数耗尽
    #[error("重试耗尽 ({attempts} 次): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// 指纹缓存冲突：同一指纹记录了不同的文档 ID
    #[error("指纹缓存冲突: {fingerprint} 已指向 {existing}，拒绝写入 {attempted}")]
    ConsistencyViolation {
        fingerprint: String,
        existing: String,
        attempted: String,
    },

    /// 文档写入失败（指纹不会被记录）
    #[error("文档存储失败: {reason}")]
    StoreFailure { reason: String },

    /// 源文件读取失败
    #[error("读取源文件失败 ({path}): {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    /// 源文件内容在扫描后发生变化
    #[error("源文件在扫描后被修改: {path}")]
    SourceChanged { path: PathBuf },
}

impl UnitError {
    /// 简短的错误类别名，用于日志和统计
    pub fn label(&self) -> &'static str {
        match self {
            UnitError::TemplateNotFound { .. } => "template_not_found",
            UnitError::Fatal { .. } => "fatal",
            UnitError::RetriesExhausted { .. } => "retries_exhausted",
            UnitError::ConsistencyViolation { .. } => "consistency_violation",
            UnitError::StoreFailure { .. } => "store_failure",
            UnitError::SourceUnreadable { .. } => "source_unreadable",
            UnitError::SourceChanged { .. } => "source_changed",
        }
    }
}

/// 应用错误枚举
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 文件扫描错误
    #[error("扫描错误: {0}")]
    Scan(#[from] crate::services::batch::ScanError),

    /// 文档存储错误
    #[error("存储错误: {0}")]
    Store(#[from] crate::services::batch::StoreError),

    /// 指纹缓存错误
    #[error("缓存错误: {0}")]
    Cache(#[from] crate::services::batch::CacheError),

    /// LLM 客户端错误
    #[error("LLM 错误: {0}")]
    Llm(#[from] crate::llm::LlmError),

    /// IO 错误
    #[error("IO 错误 ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// 便捷类型别名
pub type AppResult<T> = Result<T, AppError>;
