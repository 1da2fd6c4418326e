//! Configuration types for a conversion run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The config is fixed for the duration of one
//! conversion and every stage sees the same read-only copy (shared behind an
//! `Arc` by the [`crate::convert::Converter`]).
//!
//! Besides the typed knobs, the config carries a free-form `options` map.
//! Stages declare named settings as dependencies; the resolver looks them up
//! in the artifact bag first, then in `options`, then falls back to the
//! stage's own default. That keeps stage tuning out of this struct.
//!
//! [`ConversionOptions`] is the wire form used by the HTTP surface and the
//! CLI: loosely typed, every field optional, converted with
//! [`ConversionOptions::into_config`].

use crate::error::ConvertError;
use crate::pipeline::{FailurePolicy, MergePolicy, RenderFailurePolicy};
use crate::progress::ProgressCallback;
use crate::services::LlmService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Base URL used when falling back to a local Ollama server.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Model used when falling back to a local Ollama server.
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:latest";

/// What to do when `use_llm` is set but no service was named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmFallback {
    /// Fail with a missing-dependency error before any stage runs. (default)
    #[default]
    Require,
    /// Use a local Ollama service at [`DEFAULT_OLLAMA_BASE_URL`].
    Default,
}

/// Configuration for one conversion run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_docpipe::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .renderer("markdown+chunks")
///     .ignore_toc(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Enable LLM-assisted processors. Default: false.
    pub use_llm: bool,

    /// LLM service selector: `"ollama"` or any edgequake-llm provider name
    /// (`"openai"`, `"anthropic"`, `"gemini"`, ...).
    pub llm_service: Option<String>,

    /// Base URL of the LLM service (Ollama only).
    pub llm_base_url: Option<String>,

    /// Model identifier for the LLM service.
    pub llm_model: Option<String>,

    /// Pre-constructed LLM service. Takes precedence over `llm_service`.
    pub llm_handle: Option<Arc<dyn LlmService>>,

    /// Policy when `use_llm` is set without a service. Default: [`LlmFallback::Require`].
    pub llm_fallback: LlmFallback,

    /// Per-call LLM timeout in seconds. Default: 60.
    ///
    /// A hung call fails the processor that made it; LLM-assisted processors
    /// are skipped on failure so the rest of the document still converts.
    pub llm_timeout_secs: u64,

    /// Retries per LLM call. Default: 2.
    pub llm_max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Sampling temperature for LLM calls. Default: 0.1.
    pub llm_temperature: f32,

    /// Maximum tokens per LLM answer. Default: 2048.
    pub llm_max_tokens: usize,

    /// Skip the OCR builder. Default: true.
    pub disable_ocr: bool,

    /// Chunk renderer emits an id-keyed map instead of `{blocks, page_info}`. Default: true.
    pub output_json: bool,

    /// Hide table-of-contents blocks (and their page when early in the document). Default: false.
    pub ignore_toc: bool,

    /// Also hide every page before a detected table of contents. Default: false.
    pub ignore_before_toc: bool,

    /// Renderer shorthand, e.g. `"pageMarkdown+chunks"`. Default: page markdown + chunks.
    pub renderer: Option<String>,

    /// Explicit renderer list; wins over `renderer`.
    pub renderers: Option<Vec<String>>,

    /// Explicit processor list; replaces the default ordering.
    pub processors: Option<Vec<String>>,

    /// Force one failure policy on every processor.
    pub processor_failure_policy: Option<FailurePolicy>,

    /// What a failing renderer does to the fan-out. Default: abort.
    pub render_failure_policy: RenderFailurePolicy,

    /// How images and metadata from several renderers are combined. Default: namespaced.
    pub merge_policy: MergePolicy,

    /// 0-indexed pages to process. Default: all pages.
    pub page_range: Option<Vec<usize>>,

    /// Block type → block class name, e.g. `{"PageHeader": "visible"}`.
    pub block_overrides: BTreeMap<String, String>,

    /// Insert page separators in unified markdown. Default: false.
    pub paginate_output: bool,

    /// Run the debug processor. Default: false.
    pub debug: bool,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Rasterisation DPI for page images. Range: 72–400. Default: 96.
    pub dpi: u32,

    /// Download timeout for URL inputs in seconds. Default: 30.
    pub download_timeout_secs: u64,

    /// Optional stage progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Free-form stage settings, read by the resolver.
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_llm: false,
            llm_service: None,
            llm_base_url: None,
            llm_model: None,
            llm_handle: None,
            llm_fallback: LlmFallback::default(),
            llm_timeout_secs: 60,
            llm_max_retries: 2,
            retry_backoff_ms: 500,
            llm_temperature: 0.1,
            llm_max_tokens: 2048,
            disable_ocr: true,
            output_json: true,
            ignore_toc: false,
            ignore_before_toc: false,
            renderer: None,
            renderers: None,
            processors: None,
            processor_failure_policy: None,
            render_failure_policy: RenderFailurePolicy::default(),
            merge_policy: MergePolicy::default(),
            page_range: None,
            block_overrides: BTreeMap::new(),
            paginate_output: false,
            debug: false,
            password: None,
            dpi: 96,
            download_timeout_secs: 30,
            progress_callback: None,
            options: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("use_llm", &self.use_llm)
            .field("llm_service", &self.llm_service)
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_model", &self.llm_model)
            .field("llm_handle", &self.llm_handle.as_ref().map(|_| "<dyn LlmService>"))
            .field("llm_fallback", &self.llm_fallback)
            .field("disable_ocr", &self.disable_ocr)
            .field("output_json", &self.output_json)
            .field("ignore_toc", &self.ignore_toc)
            .field("ignore_before_toc", &self.ignore_before_toc)
            .field("renderer", &self.renderer)
            .field("renderers", &self.renderers)
            .field("processors", &self.processors)
            .field("page_range", &self.page_range)
            .field("merge_policy", &self.merge_policy)
            .field("options", &self.options)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Look up a free-form option.
    pub fn option(&self, name: &str) -> Option<&serde_json::Value> {
        self.options.get(name)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn use_llm(mut self, v: bool) -> Self {
        self.config.use_llm = v;
        self
    }

    pub fn llm_service(mut self, name: impl Into<String>) -> Self {
        self.config.llm_service = Some(name.into());
        self
    }

    pub fn llm_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.llm_base_url = Some(url.into());
        self
    }

    pub fn llm_model(mut self, model: impl Into<String>) -> Self {
        self.config.llm_model = Some(model.into());
        self
    }

    pub fn llm_handle(mut self, service: Arc<dyn LlmService>) -> Self {
        self.config.llm_handle = Some(service);
        self
    }

    pub fn llm_fallback(mut self, policy: LlmFallback) -> Self {
        self.config.llm_fallback = policy;
        self
    }

    pub fn llm_timeout_secs(mut self, secs: u64) -> Self {
        self.config.llm_timeout_secs = secs;
        self
    }

    pub fn llm_max_retries(mut self, n: u32) -> Self {
        self.config.llm_max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn llm_temperature(mut self, t: f32) -> Self {
        self.config.llm_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn llm_max_tokens(mut self, n: usize) -> Self {
        self.config.llm_max_tokens = n;
        self
    }

    pub fn disable_ocr(mut self, v: bool) -> Self {
        self.config.disable_ocr = v;
        self
    }

    pub fn output_json(mut self, v: bool) -> Self {
        self.config.output_json = v;
        self
    }

    pub fn ignore_toc(mut self, v: bool) -> Self {
        self.config.ignore_toc = v;
        self
    }

    pub fn ignore_before_toc(mut self, v: bool) -> Self {
        self.config.ignore_before_toc = v;
        self
    }

    pub fn renderer(mut self, selector: impl Into<String>) -> Self {
        self.config.renderer = Some(selector.into());
        self
    }

    pub fn renderers<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.config.renderers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn processors<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.config.processors = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn processor_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.processor_failure_policy = Some(policy);
        self
    }

    pub fn render_failure_policy(mut self, policy: RenderFailurePolicy) -> Self {
        self.config.render_failure_policy = policy;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.merge_policy = policy;
        self
    }

    pub fn page_range(mut self, pages: Vec<usize>) -> Self {
        self.config.page_range = Some(pages);
        self
    }

    pub fn block_override(mut self, block_type: impl Into<String>, class: impl Into<String>) -> Self {
        self.config
            .block_overrides
            .insert(block_type.into(), class.into());
        self
    }

    pub fn paginate_output(mut self, v: bool) -> Self {
        self.config.paginate_output = v;
        self
    }

    pub fn debug(mut self, v: bool) -> Self {
        self.config.debug = v;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.options.insert(name.into(), value);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConvertError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ConvertError::config(format!("DPI must be 72–400, got {}", c.dpi)));
        }
        if c.llm_timeout_secs == 0 {
            return Err(ConvertError::config("LLM timeout must be ≥ 1s"));
        }
        if let Some(name) = &c.llm_service {
            if name.trim().is_empty() {
                return Err(ConvertError::config("llm_service must not be empty"));
            }
        }
        if matches!(&c.renderers, Some(list) if list.is_empty()) {
            return Err(ConvertError::config("renderer list must not be empty"));
        }
        Ok(self.config)
    }
}

// ── Wire form ────────────────────────────────────────────────────────────

/// Loosely-typed request options, as accepted by the HTTP surface.
///
/// Unrecognised keys are kept in `extra` and forwarded to stages through
/// [`PipelineConfig::options`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub use_llm: Option<bool>,
    pub llm_service: Option<String>,
    #[serde(alias = "ollama_base_url")]
    pub llm_base_url: Option<String>,
    #[serde(alias = "ollama_model")]
    pub llm_model: Option<String>,
    pub disable_ocr: Option<bool>,
    pub output_json: Option<bool>,
    #[serde(rename = "ignore_TOC", alias = "ignore_toc")]
    pub ignore_toc: Option<bool>,
    #[serde(rename = "ignore_before_TOC", alias = "ignore_before_toc")]
    pub ignore_before_toc: Option<bool>,
    pub renderer: Option<String>,
    pub page_range: Option<Vec<usize>>,
    pub processors: Option<Vec<String>>,
    pub renderers: Option<Vec<String>>,
    pub block_overrides: Option<BTreeMap<String, String>>,
    pub debug: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Defaults the request surface applies when a key is absent.
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub llm_service: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub disable_ocr: bool,
    pub output_json: bool,
    pub ignore_toc: bool,
    pub ignore_before_toc: bool,
    pub renderer: String,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            llm_service: "ollama".into(),
            llm_base_url: DEFAULT_OLLAMA_BASE_URL.into(),
            llm_model: DEFAULT_OLLAMA_MODEL.into(),
            disable_ocr: true,
            output_json: true,
            ignore_toc: true,
            ignore_before_toc: true,
            renderer: "pageMarkdown+chunks".into(),
        }
    }
}

impl ConversionOptions {
    /// Merge the options over `defaults` into a validated config.
    pub fn into_config(self, defaults: &RequestDefaults) -> Result<PipelineConfig, ConvertError> {
        let use_llm = self.use_llm.unwrap_or(false);
        let mut builder = PipelineConfig::builder()
            .use_llm(use_llm)
            .disable_ocr(self.disable_ocr.unwrap_or(defaults.disable_ocr))
            .output_json(self.output_json.unwrap_or(defaults.output_json))
            .ignore_toc(self.ignore_toc.unwrap_or(defaults.ignore_toc))
            .ignore_before_toc(self.ignore_before_toc.unwrap_or(defaults.ignore_before_toc))
            .renderer(self.renderer.unwrap_or_else(|| defaults.renderer.clone()))
            .debug(self.debug.unwrap_or(false));

        if use_llm {
            builder = builder
                .llm_service(self.llm_service.unwrap_or_else(|| defaults.llm_service.clone()))
                .llm_base_url(self.llm_base_url.unwrap_or_else(|| defaults.llm_base_url.clone()))
                .llm_model(self.llm_model.unwrap_or_else(|| defaults.llm_model.clone()));
        }
        if let Some(pages) = self.page_range {
            builder = builder.page_range(pages);
        }
        if let Some(list) = self.processors {
            builder = builder.processors(list);
        }
        if let Some(list) = self.renderers {
            builder = builder.renderers(list);
        }
        for (block_type, class) in self.block_overrides.unwrap_or_default() {
            builder = builder.block_override(block_type, class);
        }
        for (name, value) in self.extra {
            builder = builder.option(name, value);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let c = PipelineConfig::default();
        assert!(!c.use_llm);
        assert!(c.disable_ocr);
        assert!(c.output_json);
        assert!(!c.ignore_toc);
        assert!(c.renderer.is_none());
        assert_eq!(c.llm_fallback, LlmFallback::Require);
    }

    #[test]
    fn builder_rejects_empty_renderer_list() {
        let err = PipelineConfig::builder()
            .renderers(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));
    }

    #[test]
    fn builder_clamps_dpi() {
        let c = PipelineConfig::builder().dpi(1000).build().unwrap();
        assert_eq!(c.dpi, 400);
    }

    #[test]
    fn options_parse_wire_names() {
        let opts: ConversionOptions = serde_json::from_value(json!({
            "use_llm": true,
            "ollama_base_url": "http://ollama:11434",
            "ollama_model": "llama3.2:latest",
            "ignore_TOC": false,
            "renderer": "markdown",
            "page_range": [4],
            "common_element_threshold": 0.3
        }))
        .unwrap();
        assert_eq!(opts.llm_base_url.as_deref(), Some("http://ollama:11434"));
        assert_eq!(opts.ignore_toc, Some(false));
        assert_eq!(opts.extra.get("common_element_threshold"), Some(&json!(0.3)));

        let config = opts.into_config(&RequestDefaults::default()).unwrap();
        assert!(config.use_llm);
        assert_eq!(config.llm_service.as_deref(), Some("ollama"));
        assert!(!config.ignore_toc);
        assert!(config.ignore_before_toc);
        assert_eq!(config.renderer.as_deref(), Some("markdown"));
        assert_eq!(config.page_range, Some(vec![4]));
        assert_eq!(config.option("common_element_threshold"), Some(&json!(0.3)));
    }

    #[test]
    fn options_without_llm_leave_service_unset() {
        let config = ConversionOptions::default()
            .into_config(&RequestDefaults::default())
            .unwrap();
        assert!(!config.use_llm);
        assert!(config.llm_service.is_none());
        assert_eq!(config.renderer.as_deref(), Some("pageMarkdown+chunks"));
    }
}
