//! 配置模块

mod app_config;

pub use app_config::{load_config, save_config, AppConfig, DEFAULT_CONFIG_FILE};
