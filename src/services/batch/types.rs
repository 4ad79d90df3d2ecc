//! 批处理管线类型定义
//!
//! 定义源文件单元、生成请求、尝试记录和单元处理结果等核心类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fingerprint::{DocumentId, Fingerprint};
use crate::error::{FailureKind, UnitError};
use crate::llm::TokenUsage;

/// 编程语言
///
/// 未识别的扩展名保存为 `Other`，由模板注册表决定是否支持。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    TypeScript,
    JavaScript,
    Python,
    Java,
    Go,
    Rust,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Swift,
    Kotlin,
    Scala,
    Vue,
    Svelte,
    Other(String),
}

impl Language {
    /// 所有内置支持的语言
    pub const SUPPORTED: [Language; 16] = [
        Language::TypeScript,
        Language::JavaScript,
        Language::Python,
        Language::Java,
        Language::Go,
        Language::Rust,
        Language::C,
        Language::Cpp,
        Language::CSharp,
        Language::Ruby,
        Language::Php,
        Language::Swift,
        Language::Kotlin,
        Language::Scala,
        Language::Vue,
        Language::Svelte,
    ];

    /// 根据文件扩展名判断语言
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "py" | "pyi" => Language::Python,
            "java" => Language::Java,
            "go" => Language::Go,
            "rs" => Language::Rust,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "swift" => Language::Swift,
            "kt" | "kts" => Language::Kotlin,
            "scala" => Language::Scala,
            "vue" => Language::Vue,
            "svelte" => Language::Svelte,
            other => Language::Other(other.to_string()),
        }
    }

    /// 根据路径判断语言
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Language::from_extension)
            .unwrap_or_else(|| Language::Other(String::new()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Swift => "swift",
            Language::Kotlin => "kotlin",
            Language::Scala => "scala",
            Language::Vue => "vue",
            Language::Svelte => "svelte",
            Language::Other(name) => name,
        }
    }

    /// 用于 prompt 的显示名称
    pub fn display_name(&self) -> &str {
        match self {
            Language::TypeScript => "TypeScript",
            Language::JavaScript => "JavaScript",
            Language::Python => "Python",
            Language::Java => "Java",
            Language::Go => "Go",
            Language::Rust => "Rust",
            Language::C => "C",
            Language::Cpp => "C++",
            Language::CSharp => "C#",
            Language::Ruby => "Ruby",
            Language::Php => "PHP",
            Language::Swift => "Swift",
            Language::Kotlin => "Kotlin",
            Language::Scala => "Scala",
            Language::Vue => "Vue",
            Language::Svelte => "Svelte",
            Language::Other(name) => name,
        }
    }
}

impl From<String> for Language {
    fn from(value: String) -> Self {
        let value = value.to_lowercase();
        match value.as_str() {
            "typescript" => Language::TypeScript,
            "javascript" => Language::JavaScript,
            "python" => Language::Python,
            "java" => Language::Java,
            "go" => Language::Go,
            "rust" => Language::Rust,
            "c" => Language::C,
            "cpp" => Language::Cpp,
            "csharp" => Language::CSharp,
            "ruby" => Language::Ruby,
            "php" => Language::Php,
            "swift" => Language::Swift,
            "kotlin" => Language::Kotlin,
            "scala" => Language::Scala,
            "vue" => Language::Vue,
            "svelte" => Language::Svelte,
            _ => Language::Other(value),
        }
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 源文件单元
///
/// 创建后不可变；指纹由文件内容、语言、输出格式和模板版本共同决定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUnit {
    /// 文件路径
    pub path: PathBuf,
    /// 编程语言
    pub language: Language,
    /// 文件大小（字节）
    pub size_bytes: u64,
    /// 内容指纹
    pub fingerprint: Fingerprint,
}

impl SourceUnit {
    /// 根据内容构造单元并计算指纹
    pub fn from_content(
        path: impl Into<PathBuf>,
        language: Language,
        content: &str,
        template_version: &str,
        output_format: OutputFormat,
    ) -> Self {
        let fingerprint = Fingerprint::compute(template_version, &language, output_format, content);
        Self {
            path: path.into(),
            language,
            size_bytes: content.len() as u64,
            fingerprint,
        }
    }
}

/// 模型参数（一次批处理内不变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 模型名称
    pub model: String,
    /// 温度
    pub temperature: f64,
    /// 最大输出 token
    pub max_tokens: u32,
    /// 输出格式
    pub output_format: OutputFormat,
    /// 单次调用超时
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 12000,
            output_format: OutputFormat::Markdown,
            timeout: Duration::from_secs(120),
        }
    }
}

/// 生成请求：调度器为每个单元创建一次
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub unit: SourceUnit,
    pub output_format: OutputFormat,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(unit: SourceUnit, config: &ModelConfig) -> Self {
        Self {
            unit,
            output_format: config.output_format,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// 单次尝试的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success {
        token_usage: TokenUsage,
        latency_ms: u64,
        response_chars: usize,
    },
    RetryableFailure {
        reason: String,
    },
    FatalFailure {
        reason: String,
    },
}

impl AttemptOutcome {
    pub fn failure(kind: FailureKind, reason: String) -> Self {
        match kind {
            FailureKind::Retryable => AttemptOutcome::RetryableFailure { reason },
            FailureKind::Fatal => AttemptOutcome::FatalFailure { reason },
        }
    }
}

/// 尝试记录：仅在处理一个单元期间存在
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub path: PathBuf,
    pub model: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// 单元处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// 生成成功
    Succeeded,
    /// 处理失败
    Failed,
    /// 已有缓存，跳过
    Skipped,
}

/// 单元处理结果：每个提交的单元恰好一个
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: SourceUnit,
    pub status: UnitStatus,
    /// 成功或跳过时指向的文档
    pub document_id: Option<DocumentId>,
    /// 仅包含成功那一次尝试的用量
    pub token_usage: TokenUsage,
    pub error: Option<UnitError>,
    /// 上游调用次数
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl UnitOutcome {
    pub fn succeeded(
        unit: SourceUnit,
        document_id: DocumentId,
        token_usage: TokenUsage,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            unit,
            status: UnitStatus::Succeeded,
            document_id: Some(document_id),
            token_usage,
            error: None,
            attempts,
            duration,
        }
    }

    pub fn skipped(unit: SourceUnit, document_id: DocumentId, duration: Duration) -> Self {
        Self {
            unit,
            status: UnitStatus::Skipped,
            document_id: Some(document_id),
            token_usage: TokenUsage::default(),
            error: None,
            attempts: 0,
            duration,
        }
    }

    pub fn failed(unit: SourceUnit, error: UnitError, attempts: u32, duration: Duration) -> Self {
        Self {
            unit,
            status: UnitStatus::Failed,
            document_id: None,
            token_usage: TokenUsage::default(),
            error: Some(error),
            attempts,
            duration,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
