//! docgen-batch
//!
//! 为大量源文件批量生成 AI 文档：有界并发、失败重试、内容指纹去重，
//! 并输出确定的批次统计（数量、token、成本、耗时）。

pub mod config;
pub mod error;
pub mod llm;
pub mod services;
pub mod utils;
