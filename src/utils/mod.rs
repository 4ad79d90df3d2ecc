//! 工具模块

mod attempt_log;

pub use attempt_log::AttemptLog;
