//! 上游调用尝试日志
//!
//! 每次上游尝试追加一行 JSON（JSONL），便于事后排查重试和失败原因。
//! 文件超过上限后只保留最新的条目。

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::services::batch::AttemptRecord;

struct LogState {
    file: Option<File>,
    lines: usize,
}

/// 尝试日志
pub struct AttemptLog {
    path: PathBuf,
    max_entries: usize,
    state: Mutex<LogState>,
}

impl AttemptLog {
    /// 创建日志（目录不存在时自动创建）
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let lines = count_lines(&path);
        Self {
            path,
            max_entries: max_entries.max(1),
            state: Mutex::new(LogState { file: None, lines }),
        }
    }

    /// 追加一条记录；写入失败只记日志，不影响批处理
    pub fn append(&self, record: &AttemptRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize attempt record: {}", e);
                return;
            }
        };

        let mut state = self.state.lock();

        // 懒加载文件
        if state.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => state.file = Some(f),
                Err(e) => {
                    warn!("Failed to open attempt log {}: {}", self.path.display(), e);
                    return;
                }
            }
        }

        if let Some(file) = state.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", json).and_then(|_| file.flush()) {
                warn!("Failed to write attempt log: {}", e);
                return;
            }
            state.lines += 1;
        }

        // 留 10% 余量，避免每次写入都重写文件
        let slack = (self.max_entries / 10).max(1);
        if state.lines > self.max_entries + slack {
            state.file = None;
            state.lines = self.truncate_to_newest();
        }
    }

    /// 最新的 `limit` 条记录（从旧到新）
    pub fn tail(&self, limit: usize) -> Vec<AttemptRecord> {
        let _state = self.state.lock();
        let lines = read_lines(&self.path);
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn truncate_to_newest(&self) -> usize {
        let lines = read_lines(&self.path);
        if lines.len() <= self.max_entries {
            return lines.len();
        }
        let keep = &lines[lines.len() - self.max_entries..];
        match File::create(&self.path) {
            Ok(mut file) => {
                for line in keep {
                    let _ = writeln!(file, "{}", line);
                }
                keep.len()
            }
            Err(e) => {
                warn!("Failed to rotate attempt log: {}", e);
                lines.len()
            }
        }
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    match File::open(path) {
        Ok(file) => BufReader::new(file).lines().map_while(Result::ok).collect(),
        Err(_) => Vec::new(),
    }
}

fn count_lines(path: &Path) -> usize {
    read_lines(path).len()
}
