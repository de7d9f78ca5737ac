//! Ollama chat backend

use anyhow::{bail, Context};
use async_trait::async_trait;
use mist_config::LlmConfig;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::llm::{ChatBackend, ChatRequest};

/// Calls `POST {endpoint}/api/chat` with streaming disabled.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            timeout,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(&config.endpoint, &config.default_model, config.timeout())
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            body["options"] = json!({ "temperature": temperature });
        }
        body
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(&request))
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("ollama request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            bail!("Ollama API error ({}): {}", status, error_text);
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .context("failed to parse ollama response")?;
        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "model": "gemma3:1b",
            "message": {"role": "assistant", "content": content},
            "done": true
        }))
    }

    #[test]
    fn test_request_body_minimal() {
        let backend = OllamaBackend::new("http://localhost:11434/", "gemma3:1b", Duration::from_secs(5));
        let body = backend.request_body(&ChatRequest::new("hi"));
        assert_eq!(
            body,
            json!({
                "model": "gemma3:1b",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            })
        );
        assert_eq!(backend.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_request_body_full() {
        let backend = OllamaBackend::new("http://x", "default", Duration::from_secs(5));
        let request = ChatRequest {
            prompt: "hi".into(),
            model: Some("llama3.2".into()),
            system: Some("be brief".into()),
            temperature: Some(0.25),
        };
        let body = backend.request_body(&request);
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(body["options"]["temperature"], 0.25);
    }

    #[tokio::test]
    async fn test_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "gemma3:1b", "stream": false})))
            .respond_with(reply("Hello from LLM"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(server.uri(), "gemma3:1b", Duration::from_secs(5));
        let text = backend.chat(ChatRequest::new("hi")).await.unwrap();
        assert_eq!(text, "Hello from LLM");
    }

    #[tokio::test]
    async fn test_chat_http_error_includes_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(server.uri(), "m", Duration::from_secs(5));
        let err = backend.chat(ChatRequest::new("hi")).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("500"));
        assert!(text.contains("model not loaded"));
    }

    #[tokio::test]
    async fn test_chat_unreachable() {
        let backend = OllamaBackend::new("http://127.0.0.1:9", "m", Duration::from_secs(2));
        let err = backend.chat(ChatRequest::new("hi")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("ollama request"));
    }
}
