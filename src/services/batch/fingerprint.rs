//! 内容指纹与文档 ID

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::types::{Language, OutputFormat};

/// 内容指纹：sha256(模板版本, 语言, 输出格式, 内容) 的十六进制
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 计算指纹
    ///
    /// 模板由 (语言, 格式) 选出，因此二者与模板版本一起参与哈希；
    /// 字段之间以 0 字节分隔，避免拼接歧义。
    pub fn compute(
        template_version: &str,
        language: &Language,
        output_format: OutputFormat,
        content: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(template_version.as_bytes());
        hasher.update([0u8]);
        hasher.update(language.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(output_format.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 文档 ID：由指纹和输出格式确定性派生
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// 文档 ID 长度（十六进制字符）
    pub const LEN: usize = 20;

    pub fn derive(fingerprint: &Fingerprint, output_format: OutputFormat) -> Self {
        let digest = Sha256::digest(format!("{}:{}", fingerprint, output_format).as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(Self::LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 仅接受十六进制字符，防止路径穿越
    pub fn parse(value: &str) -> Option<Self> {
        let valid = !value.is_empty()
            && value.len() <= 64
            && value.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// prompt 文本的短哈希，写入文档元数据
pub fn prompt_hash(prompt: &str) -> String {
    let mut hash = hex::encode(Sha256::digest(prompt.as_bytes()));
    hash.truncate(16);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic_and_sensitive() {
        let base = Fingerprint::compute("v1", &Language::Rust, OutputFormat::Markdown, "fn a() {}");
        let same = Fingerprint::compute("v1", &Language::Rust, OutputFormat::Markdown, "fn a() {}");
        assert_eq!(base, same);
        assert_eq!(base.as_str().len(), 64);

        assert_ne!(base, Fingerprint::compute("v2", &Language::Rust, OutputFormat::Markdown, "fn a() {}"));
        assert_ne!(base, Fingerprint::compute("v1", &Language::Go, OutputFormat::Markdown, "fn a() {}"));
        assert_ne!(base, Fingerprint::compute("v1", &Language::Rust, OutputFormat::Json, "fn a() {}"));
        assert_ne!(base, Fingerprint::compute("v1", &Language::Rust, OutputFormat::Markdown, "fn b() {}"));
    }

    #[test]
    fn test_document_id_derivation() {
        let fp = Fingerprint::compute("v1", &Language::Python, OutputFormat::Markdown, "pass");
        let id = DocumentId::derive(&fp, OutputFormat::Markdown);
        assert_eq!(id.as_str().len(), DocumentId::LEN);
        assert_eq!(id, DocumentId::derive(&fp, OutputFormat::Markdown));
        assert_ne!(id, DocumentId::derive(&fp, OutputFormat::Json));
    }

    #[test]
    fn test_document_id_parse_rejects_paths() {
        assert!(DocumentId::parse("../etc/passwd").is_none());
        assert!(DocumentId::parse("").is_none());
        assert_eq!(DocumentId::parse("ABCDEF0123").unwrap().as_str(), "abcdef0123");
    }
}
