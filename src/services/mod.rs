//! LLM service handles used by LLM-assisted processors.
//!
//! The pipeline treats a service as an opaque [`LlmService`] handle: the
//! converter resolves at most one per run and installs it in the
//! [`crate::pipeline::ArtifactBag`]; processors that declared a dependency on
//! it receive it through the resolver and call it via [`ask_llm`], which adds
//! the per-call timeout and retry policy.
//!
//! ## Retry strategy
//!
//! Local and hosted LLM endpoints both fail transiently under load.
//! Exponential backoff (`retry_backoff_ms * 2^attempt`) spaces the attempts:
//! with a 500 ms base and 2 retries the waits are 500 ms → 1 s.

mod ollama;
mod provider;

pub use ollama::OllamaService;
pub use provider::ProviderService;

use crate::config::{LlmFallback, PipelineConfig, DEFAULT_OLLAMA_BASE_URL, DEFAULT_OLLAMA_MODEL};
use crate::error::{ConvertError, StageError};
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// One prompt for an LLM service.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Page or block crops attached to the prompt.
    pub images: Vec<EncodedImage>,
    /// Ask the service for a JSON answer.
    pub json: bool,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn image(mut self, image: EncodedImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// An LLM backend the pipeline can call.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Short name for logs, e.g. `"ollama:llama3.2:latest"`.
    fn name(&self) -> &str;

    /// Produce the answer text for one request. One attempt, no retries.
    async fn generate(&self, request: &LlmRequest) -> Result<String, StageError>;
}

/// Call settings shared by every LLM-assisted processor of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlmSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl LlmSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout_secs: config.llm_timeout_secs,
            max_retries: config.llm_max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }
}

/// Send `request` with the run's timeout and retry policy.
///
/// Every attempt is bounded by `timeout_secs`; a hung call becomes
/// [`StageError::Timeout`] rather than blocking the chain.
pub async fn ask_llm(
    service: &dyn LlmService,
    mut request: LlmRequest,
    settings: &LlmSettings,
) -> Result<String, StageError> {
    request.temperature = settings.temperature;
    request.max_tokens = settings.max_tokens;
    let limit = Duration::from_secs(settings.timeout_secs);
    let mut last_err = StageError::failed("no attempt made");

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let backoff = settings.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                service.name(),
                attempt,
                settings.max_retries,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(limit, service.generate(&request)).await {
            Ok(Ok(answer)) => {
                debug!("{}: answered with {} chars", service.name(), answer.len());
                return Ok(answer);
            }
            Ok(Err(e)) => {
                warn!("{}: attempt {} failed: {}", service.name(), attempt + 1, e);
                last_err = e;
            }
            Err(_) => {
                warn!(
                    "{}: attempt {} timed out after {}s",
                    service.name(),
                    attempt + 1,
                    settings.timeout_secs
                );
                last_err = StageError::Timeout {
                    secs: settings.timeout_secs,
                };
            }
        }
    }

    Err(match last_err {
        StageError::Timeout { secs } => StageError::Timeout { secs },
        other => StageError::LlmFailed {
            retries: settings.max_retries,
            detail: other.to_string(),
        },
    })
}

/// Resolve the run's LLM service from configuration.
///
/// Order: explicit handle, then the `llm_service` selector, then (only when
/// `use_llm` is set) the fallback policy. Returns `None` when no service is
/// wanted.
pub fn resolve_service(config: &PipelineConfig) -> Result<Option<Arc<dyn LlmService>>, ConvertError> {
    if let Some(handle) = &config.llm_handle {
        info!("Using caller-supplied LLM service {}", handle.name());
        return Ok(Some(Arc::clone(handle)));
    }

    if let Some(selector) = &config.llm_service {
        if !config.use_llm {
            debug!("llm_service '{}' configured but use_llm is off", selector);
            return Ok(None);
        }
        return service_from_selector(selector, config).map(Some);
    }

    if !config.use_llm {
        return Ok(None);
    }

    match config.llm_fallback {
        LlmFallback::Require => Err(ConvertError::MissingDependency {
            stage: "converter".into(),
            dependency: crate::pipeline::LLM_SERVICE.into(),
        }),
        LlmFallback::Default => {
            info!(
                "No LLM service configured, falling back to Ollama at {}",
                DEFAULT_OLLAMA_BASE_URL
            );
            let service = OllamaService::new(
                config.llm_base_url.as_deref().unwrap_or(DEFAULT_OLLAMA_BASE_URL),
                config.llm_model.as_deref().unwrap_or(DEFAULT_OLLAMA_MODEL),
            );
            Ok(Some(Arc::new(service)))
        }
    }
}

fn service_from_selector(
    selector: &str,
    config: &PipelineConfig,
) -> Result<Arc<dyn LlmService>, ConvertError> {
    let name = selector.trim().to_ascii_lowercase();
    // Accept dotted class paths like "services.ollama.OllamaService".
    let short = name
        .rsplit('.')
        .find(|part| !part.is_empty() && !part.ends_with("service"))
        .unwrap_or(name.as_str())
        .to_string();
    match short.as_str() {
        "ollama" => Ok(Arc::new(OllamaService::new(
            config.llm_base_url.as_deref().unwrap_or(DEFAULT_OLLAMA_BASE_URL),
            config.llm_model.as_deref().unwrap_or(DEFAULT_OLLAMA_MODEL),
        ))),
        other => {
            let model = config.llm_model.as_deref().ok_or_else(|| {
                ConvertError::MissingDependency {
                    stage: format!("llm service '{other}'"),
                    dependency: "llm_model".into(),
                }
            })?;
            Ok(Arc::new(ProviderService::create(other, model)?))
        }
    }
}

/// A deterministic service that always answers with the same text.
///
/// Useful for dry runs and for exercising LLM-assisted processors without a
/// network endpoint.
pub struct StaticService {
    answer: String,
    calls: AtomicUsize,
}

impl StaticService {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for StaticService {
    fn name(&self) -> &str {
        "static"
    }

    async fn generate(&self, _request: &LlmRequest) -> Result<String, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl LlmService for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _request: &LlmRequest) -> Result<String, StageError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StageError::failed("503"));
            }
            Ok("fine".into())
        }
    }

    struct Hangs;

    #[async_trait]
    impl LlmService for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn generate(&self, _request: &LlmRequest) -> Result<String, StageError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn settings(retries: u32) -> LlmSettings {
        LlmSettings {
            timeout_secs: 1,
            max_retries: retries,
            retry_backoff_ms: 1,
            temperature: 0.0,
            max_tokens: 16,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let svc = Flaky {
            failures_left: AtomicUsize::new(2),
        };
        let out = ask_llm(&svc, LlmRequest::new("hi"), &settings(2)).await;
        assert_eq!(out.unwrap(), "fine");
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let svc = Flaky {
            failures_left: AtomicUsize::new(5),
        };
        let out = ask_llm(&svc, LlmRequest::new("hi"), &settings(1)).await;
        assert!(matches!(out, Err(StageError::LlmFailed { retries: 1, .. })));
    }

    #[tokio::test]
    async fn hung_call_times_out() {
        let out = ask_llm(&Hangs, LlmRequest::new("hi"), &settings(0)).await;
        assert!(matches!(out, Err(StageError::Timeout { secs: 1 })));
    }

    #[test]
    fn no_service_without_use_llm() {
        assert!(resolve_service(&PipelineConfig::default()).unwrap().is_none());
    }

    #[test]
    fn require_policy_fails_without_selector() {
        let config = PipelineConfig::builder().use_llm(true).build().unwrap();
        match resolve_service(&config) {
            Err(ConvertError::MissingDependency { dependency, .. }) => {
                assert_eq!(dependency, "llm_service")
            }
            other => panic!("expected MissingDependency, got {:?}", other.map(|s| s.is_some())),
        }
    }

    #[test]
    fn default_policy_falls_back_to_ollama() {
        let config = PipelineConfig::builder()
            .use_llm(true)
            .llm_fallback(LlmFallback::Default)
            .build()
            .unwrap();
        let service = resolve_service(&config).unwrap().unwrap();
        assert_eq!(service.name(), "ollama:llama3.2:latest");
    }

    #[test]
    fn explicit_handle_wins() {
        let config = PipelineConfig::builder()
            .use_llm(true)
            .llm_service("ollama")
            .llm_handle(Arc::new(StaticService::new("x")))
            .build()
            .unwrap();
        assert_eq!(resolve_service(&config).unwrap().unwrap().name(), "static");
    }

    #[test]
    fn dotted_selector_maps_to_ollama() {
        let config = PipelineConfig::builder()
            .use_llm(true)
            .llm_service("services.ollama.OllamaService")
            .llm_model("qwen2.5:7b")
            .build()
            .unwrap();
        assert_eq!(resolve_service(&config).unwrap().unwrap().name(), "ollama:qwen2.5:7b");
    }
}
