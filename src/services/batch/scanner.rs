//! 工作区扫描器
//!
//! 遍历源码目录，按包含/排除模式筛选文件，读取内容并计算指纹，
//! 产出按路径排序的 SourceUnit 列表。

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::types::{Language, OutputFormat, SourceUnit};
use crate::config::AppConfig;

/// 扫描选项
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_file_size: u64,
    pub template_version: String,
    pub output_format: OutputFormat,
}

impl ScanOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            include_patterns: config.include_patterns.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
            max_file_size: config.max_file_size,
            template_version: config.template_version.clone(),
            output_format: config.output_format,
        }
    }
}

/// 工作区扫描器
pub struct WorkspaceScanner {
    options: ScanOptions,
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, p, e);
                None
            }
        })
        .collect()
}

impl WorkspaceScanner {
    pub fn new(options: ScanOptions) -> Self {
        let include = compile_patterns(&options.include_patterns, "include");
        let exclude = compile_patterns(&options.exclude_patterns, "exclude");
        Self {
            options,
            include,
            exclude,
        }
    }

    /// 扫描目录
    pub fn scan(&self, root: &Path) -> Result<Vec<SourceUnit>, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        info!("Starting workspace scan: {}", root.display());
        let mut units = Vec::new();

        let walker = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.should_ignore(entry, root));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_included(entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
            if let Some(unit) = self.try_load(entry.path()) {
                units.push(unit);
            }
        }

        units.sort_by(|a, b| a.path.cmp(&b.path));
        info!("Scan completed: {} files", units.len());
        Ok(units)
    }

    /// 读取失败的文件只记录警告并跳过，不影响其余文件
    fn try_load(&self, path: &Path) -> Option<SourceUnit> {
        match self.load_unit(path) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("Skipping unreadable file: {}", e);
                None
            }
        }
    }

    fn load_unit(&self, path: &Path) -> Result<Option<SourceUnit>, ScanError> {
        let metadata = fs::metadata(path).map_err(|e| ScanError::IoError(path.to_path_buf(), e))?;
        if metadata.len() > self.options.max_file_size {
            debug!("Skipping oversized file: {} ({} bytes)", path.display(), metadata.len());
            return Ok(None);
        }

        let bytes = fs::read(path).map_err(|e| ScanError::IoError(path.to_path_buf(), e))?;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                warn!("Skipping non UTF-8 file: {}", path.display());
                return Ok(None);
            }
        };

        Ok(Some(SourceUnit::from_content(
            path,
            Language::from_path(path),
            &content,
            &self.options.template_version,
            self.options.output_format,
        )))
    }

    /// 隐藏条目和匹配排除模式（按名称或相对路径）的条目被忽略
    fn should_ignore(&self, entry: &DirEntry, root: &Path) -> bool {
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        self.exclude
            .iter()
            .any(|pattern| pattern.matches(&name) || pattern.matches(&relative))
    }

    fn is_included(&self, name: &str) -> bool {
        self.include.iter().any(|pattern| pattern.matches(name))
    }
}

/// 扫描错误类型
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("路径不存在: {0}")]
    PathNotFound(PathBuf),

    #[error("路径不是目录: {0}")]
    NotADirectory(PathBuf),

    #[error("IO错误 ({0}): {1}")]
    IoError(PathBuf, #[source] std::io::Error),
}
