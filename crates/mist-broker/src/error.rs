use thiserror::Error;

/// Failure while executing a service request. Its `Display` text is what
/// the caller receives in the `service.error` payload.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown {service} action: {action}")]
    UnknownAction { service: String, action: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Model backend failure; the backend's own message is kept verbatim.
    #[error("{0:#}")]
    Backend(anyhow::Error),

    #[error("task store error: {0}")]
    Store(String),

    #[error("service panicked: {0}")]
    Panicked(String),
}

impl ServiceError {
    pub fn missing(param: &str) -> Self {
        Self::InvalidParams(format!("missing required parameter '{}'", param))
    }

    pub fn invalid(param: &str, expected: &str) -> Self {
        Self::InvalidParams(format!("parameter '{}' must be {}", param, expected))
    }
}
