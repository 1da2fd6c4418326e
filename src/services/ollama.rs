//! Ollama chat service over its native `/api/chat` endpoint.

use super::{LlmRequest, LlmService};
use crate::error::StageError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Talks to an Ollama server with non-streaming chat requests.
///
/// The per-call deadline is enforced by [`super::ask_llm`], so the client
/// itself carries no timeout.
pub struct OllamaService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    label: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaService {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            label: format!("ollama:{model}"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        let mut user = json!({ "role": "user", "content": request.prompt });
        if !request.images.is_empty() {
            user["images"] = json!(request
                .images
                .iter()
                .map(|img| img.base64.as_str())
                .collect::<Vec<_>>());
        }
        messages.push(user);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if request.json {
            body["format"] = json!("json");
        }
        body
    }
}

#[async_trait]
impl LlmService for OllamaService {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, StageError> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| StageError::failed(format!("Ollama request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::failed(format!("Ollama API error ({status}): {text}")));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| StageError::BadResponse(format!("failed to parse Ollama response: {e}")))?;
        tracing::debug!(
            "{}: {} prompt tokens, {} completion tokens",
            self.label,
            parsed.prompt_eval_count.unwrap_or(0),
            parsed.eval_count.unwrap_or(0)
        );
        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::EncodedImage;

    #[test]
    fn body_carries_system_images_and_format() {
        let svc = OllamaService::new("http://localhost:11434/", "llama3.2:latest");
        assert_eq!(svc.base_url(), "http://localhost:11434");
        let mut req = LlmRequest::new("describe")
            .system("be brief")
            .image(EncodedImage {
                base64: "AAAA".into(),
                mime: "image/png",
            })
            .json();
        req.temperature = 0.2;
        req.max_tokens = 64;
        let body = svc.body(&req);
        assert_eq!(body["model"], "llama3.2:latest");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["images"][0], "AAAA");
        assert_eq!(body["format"], "json");
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn parses_chat_response() {
        let raw = r#"{"model":"m","message":{"role":"assistant","content":"hi"},"done":true,"eval_count":3}"#;
        let parsed: OllamaResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.message.content, "hi");
        assert_eq!(parsed.eval_count, Some(3));
    }
}
