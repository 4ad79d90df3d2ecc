//! 应用配置管理
//!
//! 从 JSON 文件加载配置，并允许环境变量覆盖密钥等敏感字段。
//! 配置在启动时加载一次，以不可变结构体的形式传入调度器，不使用全局单例。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::services::batch::{ModelConfig, ModelPrice, OutputFormat, RetryConfig, TemplateOverride};

/// 默认配置文件名（当前工作目录下）
pub const DEFAULT_CONFIG_FILE: &str = "docgen.json";

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM API 密钥
    #[serde(default)]
    pub api_key: String,

    /// LLM API 基础 URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// 模型名称
    #[serde(default = "default_model")]
    pub model: String,

    /// 温度参数 (0.0 - 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// 最大 token 数
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// 单次上游调用超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// worker 数量
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// 同时在途的上游请求上限（与 worker 数量无关）
    #[serde(default = "default_dispatch_limit")]
    pub dispatch_limit: usize,

    /// 重试策略
    #[serde(default)]
    pub retry: RetryConfig,

    /// 输出格式
    #[serde(default)]
    pub output_format: OutputFormat,

    /// 模板版本，参与指纹计算；修改后缓存全部失效
    #[serde(default = "default_template_version")]
    pub template_version: String,

    /// 自定义模板
    #[serde(default)]
    pub template_overrides: Vec<TemplateOverride>,

    /// 包含的文件模式
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,

    /// 排除的目录/文件模式
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// 最大文件大小（字节，默认1MB）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// 数据目录：文档、指纹索引、批次汇总、请求日志
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 模型价格表（每 1K token，美元）
    #[serde(default = "default_pricing")]
    pub pricing: HashMap<String, ModelPrice>,

    /// 连续多少次存储失败视为存储不可用
    #[serde(default = "default_store_outage_threshold")]
    pub store_outage_threshold: usize,

    /// 请求日志最多保留的条目数
    #[serde(default = "default_attempt_log_max_entries")]
    pub attempt_log_max_entries: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    12000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_workers() -> usize {
    8
}

fn default_dispatch_limit() -> usize {
    4
}

fn default_template_version() -> String {
    "v1".to_string()
}

fn default_include_patterns() -> Vec<String> {
    [
        "*.ts", "*.tsx", "*.js", "*.jsx", "*.py", "*.java", "*.go", "*.rs", "*.c", "*.cpp",
        "*.h", "*.hpp", "*.cs", "*.rb", "*.php", "*.swift", "*.kt", "*.scala", "*.vue",
        "*.svelte",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_patterns() -> Vec<String> {
    [
        "node_modules", "dist", "build", "target", ".git", "__pycache__", ".venv", "venv",
        ".next", "out", ".cache", "*.test.ts", "*.spec.ts", "*.min.js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".docgen")
}

fn default_pricing() -> HashMap<String, ModelPrice> {
    let mut prices = HashMap::new();
    prices.insert("gpt-4o".to_string(), ModelPrice::new(0.0025, 0.01));
    prices.insert("gpt-4o-mini".to_string(), ModelPrice::new(0.00015, 0.0006));
    prices.insert("gpt-4.1".to_string(), ModelPrice::new(0.002, 0.008));
    prices.insert("claude-3-5-sonnet".to_string(), ModelPrice::new(0.003, 0.015));
    prices.insert("claude-3-5-haiku".to_string(), ModelPrice::new(0.0008, 0.004));
    prices
}

fn default_store_outage_threshold() -> usize {
    5
}

fn default_attempt_log_max_entries() -> usize {
    5000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            workers: default_workers(),
            dispatch_limit: default_dispatch_limit(),
            retry: RetryConfig::default(),
            output_format: OutputFormat::default(),
            template_version: default_template_version(),
            template_overrides: Vec::new(),
            include_patterns: default_include_patterns(),
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
            data_dir: default_data_dir(),
            pricing: default_pricing(),
            store_outage_threshold: default_store_outage_threshold(),
            attempt_log_max_entries: default_attempt_log_max_entries(),
        }
    }
}

impl AppConfig {
    /// 使用环境变量覆盖配置
    ///
    /// 支持 `DOCGEN_API_KEY`、`DOCGEN_BASE_URL`、`DOCGEN_MODEL`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("DOCGEN_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = key;
        }
        if let Some(url) = lookup("DOCGEN_BASE_URL").filter(|v| !v.is_empty()) {
            self.base_url = url;
        }
        if let Some(model) = lookup("DOCGEN_MODEL").filter(|v| !v.is_empty()) {
            self.model = model;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> AppResult<()> {
        if self.workers == 0 {
            return Err(AppError::Config("workers 必须大于 0".to_string()));
        }
        if self.dispatch_limit == 0 {
            return Err(AppError::Config("dispatch_limit 必须大于 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts 必须大于 0".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AppError::Config(format!(
                "temperature 超出范围 (0.0 - 2.0): {}",
                self.temperature
            )));
        }
        if self.include_patterns.is_empty() {
            return Err(AppError::Config("include_patterns 不能为空".to_string()));
        }
        for template in &self.template_overrides {
            template
                .check()
                .map_err(|e| AppError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// 生成参数
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            output_format: self.output_format,
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// 文档存储目录
    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    /// 指纹索引文件
    pub fn fingerprint_index_path(&self) -> PathBuf {
        self.data_dir.join("fingerprints.json")
    }

    /// 批次汇总目录
    pub fn batches_dir(&self) -> PathBuf {
        self.data_dir.join("batches")
    }

    /// 请求日志文件
    pub fn attempt_log_path(&self) -> PathBuf {
        self.data_dir.join("attempts.jsonl")
    }
}

/// 加载配置
///
/// 指定了路径时文件必须存在；未指定时尝试当前目录下的 `docgen.json`，不存在则使用默认配置。
/// 加载后应用环境变量覆盖并校验。
pub fn load_config(path: Option<&Path>) -> AppResult<AppConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                read_config_file(fallback)?
            } else {
                debug!("No config file found, using defaults");
                AppConfig::default()
            }
        }
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> AppResult<AppConfig> {
    let content = fs::read_to_string(path).map_err(|e| AppError::Io(path.to_path_buf(), e))?;
    let config = serde_json::from_str(&content)
        .map_err(|e| AppError::Config(format!("解析配置文件失败 ({}): {}", path.display(), e)))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// 保存配置到文件
pub fn save_config(config: &AppConfig, path: &Path) -> AppResult<()> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("序列化配置失败: {}", e)))?;
    fs::write(path, content).map_err(|e| AppError::Io(path.to_path_buf(), e))?;
    Ok(())
}
