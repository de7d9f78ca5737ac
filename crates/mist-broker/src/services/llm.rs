//! LLM chat service.
//!
//! Actions:
//! - `chat {prompt, model?, system?, temperature?}` -> reply text
//!
//! Backend calls go through a semaphore sized by `llm.max_concurrent`;
//! requests beyond that wait their turn.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::params::{self, Params};
use crate::error::ServiceError;

/// One single-turn chat call. Optional fields are forwarded only when the
/// caller supplied them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub system: Option<String>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    fn from_params(params: &Params) -> Result<Self, ServiceError> {
        Ok(Self {
            prompt: params::require_str(params, "prompt")?.to_string(),
            model: params::optional_str(params, "model")?.map(str::to_string),
            system: params::optional_str(params, "system")?.map(str::to_string),
            temperature: params::optional_f64(params, "temperature")?,
        })
    }
}

/// A model backend. Errors are reported to the caller verbatim.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<String>;
}

pub struct LlmService {
    backend: Arc<dyn ChatBackend>,
    permits: Semaphore,
}

impl LlmService {
    pub const NAME: &'static str = "llm";

    pub fn new(backend: Arc<dyn ChatBackend>, max_concurrent: usize) -> Self {
        Self {
            backend,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, ServiceError> {
        match action {
            "chat" => {
                let request = ChatRequest::from_params(&params::as_object(params)?)?;
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| ServiceError::Backend(e.into()))?;
                debug!(model = ?request.model, "llm chat");
                let text = self
                    .backend
                    .chat(request)
                    .await
                    .map_err(ServiceError::Backend)?;
                Ok(Value::String(text))
            }
            other => Err(ServiceError::UnknownAction {
                service: Self::NAME.to_string(),
                action: other.to_string(),
            }),
        }
    }
}
