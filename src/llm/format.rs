//! API 格式检测和端点构建

use serde::{Deserialize, Serialize};

/// API 格式枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFormat {
    /// OpenAI Chat Completions API
    OpenAi,
    /// Anthropic Messages API
    Anthropic,
}

impl ApiFormat {
    /// 根据模型名称检测 API 格式：包含 "claude" 则使用 Anthropic 格式
    pub fn detect(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            ApiFormat::Anthropic
        } else {
            ApiFormat::OpenAi
        }
    }

    /// 完整请求端点
    pub fn endpoint(&self, base_url: &str) -> String {
        let url = fix_base_url(base_url);
        let suffix = match self {
            ApiFormat::OpenAi => "/chat/completions",
            ApiFormat::Anthropic => "/messages",
        };

        if url.ends_with(suffix) {
            url
        } else if url.ends_with("/v1") {
            format!("{}{}", url, suffix)
        } else {
            format!("{}/v1{}", url, suffix)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAi => "openai",
            ApiFormat::Anthropic => "anthropic",
        }
    }
}

/// 去掉末尾斜杠并合并路径中的双斜杠（保留协议部分）
pub fn fix_base_url(base_url: &str) -> String {
    let url = base_url.trim_end_matches('/');
    match url.find("://") {
        Some(pos) => {
            let (protocol, rest) = url.split_at(pos + 3);
            let mut fixed = rest.to_string();
            while fixed.contains("//") {
                fixed = fixed.replace("//", "/");
            }
            format!("{}{}", protocol, fixed)
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(ApiFormat::detect("gpt-4o"), ApiFormat::OpenAi);
        assert_eq!(ApiFormat::detect("deepseek-chat"), ApiFormat::OpenAi);
        assert_eq!(ApiFormat::detect("Claude-3-5-Sonnet"), ApiFormat::Anthropic);
    }

    #[test]
    fn test_fix_base_url() {
        assert_eq!(fix_base_url("https://api.openai.com/"), "https://api.openai.com");
        assert_eq!(fix_base_url("https://api.openai.com//v1"), "https://api.openai.com/v1");
        assert_eq!(fix_base_url("http://localhost:8080///v1/"), "http://localhost:8080/v1");
    }

    #[test]
    fn test_endpoints() {
        let openai = ApiFormat::OpenAi;
        assert_eq!(
            openai.endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            openai.endpoint("https://text.pollinations.ai/openai/v1/chat/completions"),
            "https://text.pollinations.ai/openai/v1/chat/completions"
        );

        let anthropic = ApiFormat::Anthropic;
        assert_eq!(
            anthropic.endpoint("https://api.anthropic.com/v1"),
            "https://api.anthropic.com/v1/messages"
        );
    }
}
