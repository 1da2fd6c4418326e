//! Hosted LLM providers through edgequake-llm.

use super::{LlmRequest, LlmService};
use crate::error::{ConvertError, StageError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;

/// Wraps any [`LLMProvider`] (OpenAI, Anthropic, Gemini, Azure, ...).
pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl ProviderService {
    /// Create through [`ProviderFactory`], which reads the provider's API
    /// key (`OPENAI_API_KEY`, ...) from the environment.
    pub fn create(provider_name: &str, model: &str) -> Result<Self, ConvertError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
            ConvertError::ProviderNotConfigured {
                service: provider_name.to_string(),
                hint: format!("{e}"),
            }
        })?;
        Ok(Self::from_provider(provider, format!("{provider_name}:{model}")))
    }

    pub fn from_provider(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }

    fn messages(request: &LlmRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        if request.images.is_empty() {
            messages.push(ChatMessage::user(request.prompt.as_str()));
        } else {
            let images = request
                .images
                .iter()
                .map(|img| ImageData::new(img.base64.clone(), img.mime).with_detail("high"))
                .collect();
            messages.push(ChatMessage::user_with_images(request.prompt.as_str(), images));
        }
        messages
    }
}

#[async_trait]
impl LlmService for ProviderService {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, StageError> {
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };
        let response = self
            .provider
            .chat(&Self::messages(request), Some(&options))
            .await
            .map_err(|e| StageError::failed(format!("{e}")))?;
        tracing::debug!(
            "{}: {} input tokens, {} output tokens",
            self.label,
            response.prompt_tokens,
            response.completion_tokens
        );
        Ok(response.content)
    }
}
