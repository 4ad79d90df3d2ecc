//! LLM Prompt 模板
//!
//! 模板按 (语言, 输出格式) 注册，在启动时一次性解析为渲染闭包。
//! 渲染是纯函数，只会因为缺少模板而失败。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::types::{Language, OutputFormat};
use crate::error::UnitError;

/// 代码内容占位符
pub const CODE_PLACEHOLDER: &str = "{code_content}";
/// 语言名称占位符
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

/// Markdown 文档 Prompt
pub const MARKDOWN_DOC_PROMPT: &str = r#"Generate comprehensive technical documentation in Markdown for the following {language} source file.

Source code:
```
{code_content}
```

The documentation must contain:
1. Overview: what this file is responsible for and where it fits in the codebase
2. Exports: every exported class, function, type, interface and constant, with its signature
3. Parameters and return values for each public function or method
4. Dependencies: the modules this file imports and why
5. Key logic: a short explanation of any non-trivial algorithm or control flow
6. Usage: a minimal example when the file exposes a public API

Write only the documentation. Do not repeat the source code verbatim."#;

/// JSON 文档 Prompt
pub const JSON_DOC_PROMPT: &str = r#"Analyze the following {language} source file and describe it as a single JSON object.

Source code:
```
{code_content}
```

Respond with JSON only, no surrounding prose or code fences, using this shape:
{
  "summary": "one paragraph overview",
  "exports": [
    {"name": "...", "kind": "function|class|type|interface|constant", "signature": "...", "description": "..."}
  ],
  "dependencies": ["module names imported by this file"],
  "notes": ["important behaviours, side effects or caveats"]
}"#;

/// 渲染函数
pub type RenderFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// 配置中的自定义模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateOverride {
    /// 语言（如 "typescript"、"lua"）
    pub language: String,
    /// 输出格式
    pub format: OutputFormat,
    /// 模板文本，必须包含 `{code_content}`，可选 `{language}`
    pub template: String,
}

impl TemplateOverride {
    /// 检查模板是否包含代码占位符
    pub fn check(&self) -> Result<(), TemplateError> {
        if self.template.contains(CODE_PLACEHOLDER) {
            Ok(())
        } else {
            Err(TemplateError::MissingPlaceholder {
                language: self.language.clone(),
                format: self.format,
            })
        }
    }
}

/// 模板错误
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("模板 ({language}, {format}) 缺少 {{code_content}} 占位符")]
    MissingPlaceholder { language: String, format: OutputFormat },
}

/// 用文本模板构造渲染闭包
///
/// 先替换语言名，最后替换代码内容，避免代码中的花括号被当作占位符。
fn text_template(template: String, language_name: String) -> RenderFn {
    let template = template.replace(LANGUAGE_PLACEHOLDER, &language_name);
    Arc::new(move |code: &str| template.replace(CODE_PLACEHOLDER, code))
}

/// 模板注册表
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<(Language, OutputFormat), RenderFn>,
}

impl TemplateRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置模板：所有支持语言 × 所有输出格式
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for language in Language::SUPPORTED.iter() {
            let name = language.display_name().to_string();
            registry.register(
                language.clone(),
                OutputFormat::Markdown,
                text_template(MARKDOWN_DOC_PROMPT.to_string(), name.clone()),
            );
            registry.register(
                language.clone(),
                OutputFormat::Json,
                text_template(JSON_DOC_PROMPT.to_string(), name),
            );
        }
        registry
    }

    /// 内置模板 + 配置覆盖
    pub fn with_overrides(overrides: &[TemplateOverride]) -> Result<Self, TemplateError> {
        let mut registry = Self::builtin();
        for item in overrides {
            item.check()?;
            let language = Language::from(item.language.clone());
            let name = language.display_name().to_string();
            registry.register(language, item.format, text_template(item.template.clone(), name));
        }
        Ok(registry)
    }

    /// 注册渲染函数（覆盖已有模板）
    pub fn register(&mut self, language: Language, format: OutputFormat, render: RenderFn) {
        self.templates.insert((language, format), render);
    }

    pub fn contains(&self, language: &Language, format: OutputFormat) -> bool {
        self.templates.contains_key(&(language.clone(), format))
    }

    /// 渲染 Prompt
    pub fn render(
        &self,
        language: &Language,
        format: OutputFormat,
        code: &str,
    ) -> Result<String, UnitError> {
        self.templates
            .get(&(language.clone(), format))
            .map(|render| render(code))
            .ok_or_else(|| UnitError::TemplateNotFound {
                language: language.to_string(),
                format: format.to_string(),
            })
    }

    /// 返回给定语言中没有模板的那些（去重、排序）
    pub fn missing<'a, I>(&self, languages: I, format: OutputFormat) -> BTreeSet<Language>
    where
        I: IntoIterator<Item = &'a Language>,
    {
        languages
            .into_iter()
            .filter(|language| !self.contains(language, format))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
