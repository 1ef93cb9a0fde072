//! Error taxonomy shared by adapters, decorators and the REST facade.
//!
//! # Error Handling Philosophy
//!
//! Every error carries a machine-readable [`LlmError::code`] and structured
//! [`LlmError::details`], so callers can branch on the kind of failure and
//! the REST facade can translate it into an HTTP status without string
//! matching.
//!
//! | Error | Cause | HTTP |
//! |-------|-------|------|
//! | `ModelNotFound` | Model unknown to the adapter | 404 |
//! | `ModelLoad` | Pull or warm-up generation failed | 502 |
//! | `Completion` | Any failure during completion/chat/embedding | cause |
//! | `ApiKeyMissing` | Hosted provider without credential | 503 |
//! | `NotSupported` | Capability missing on this provider | 501 |
//! | `RateLimited` | HTTP 429 | 429 |
//! | `ServerError` | HTTP 5xx | 502 |
//!
//! # Retry Classification
//!
//! Only transport and rate-limit failures are retryable (429, 5xx, network
//! errors, timeouts). Authentication and validation failures propagate
//! immediately. See [`crate::retry`].

use serde_json::{json, Value};
use thiserror::Error;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Maximum number of prompt characters kept in a [`LlmError::Completion`].
const PROMPT_PREVIEW_CHARS: usize = 80;

// ============================================================================
// LLM Error Types
// ============================================================================

/// Errors that can occur while routing model requests.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The referenced model is unknown to the adapter.
    #[error("Model not found: {model} (provider: {provider})")]
    ModelNotFound { model: String, provider: String },

    /// Loading (pulling or warming up) a model failed.
    #[error("Failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    /// A completion, chat or embedding call failed; wraps the cause.
    #[error("Completion failed for model {model}: {source}")]
    Completion {
        model: String,
        /// Truncated prompt for log context.
        prompt: String,
        #[source]
        source: Box<LlmError>,
    },

    /// Hosted provider used without a credential.
    #[error("API key not configured for provider {provider}")]
    ApiKeyMissing { provider: String },

    /// Feature not supported by this provider.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Rate limit exceeded (HTTP 429).
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Authentication error (HTTP 401/403).
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Invalid request parameters (other HTTP 4xx).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream server failure (HTTP 5xx).
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Malformed or unexpected API response.
    #[error("API error: {0}")]
    ApiError(String),

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Timeout error.
    #[error("Request timed out")]
    Timeout,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::NetworkError(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            LlmError::ApiError(format!("Failed to decode response: {}", err))
        } else {
            LlmError::NetworkError(err.to_string())
        }
    }
}

impl LlmError {
    /// Map a non-success HTTP status and body to a transport error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::AuthError(body),
            429 => Self::RateLimited(body),
            500..=599 => Self::ServerError {
                status,
                message: body,
            },
            400..=499 => Self::InvalidRequest(format!("HTTP {}: {}", status, body)),
            _ => Self::ApiError(format!("unexpected status {}: {}", status, body)),
        }
    }

    /// Wrap a cause into a [`LlmError::Completion`] with a truncated prompt.
    ///
    /// Errors that already belong to the taxonomy (model not found, missing
    /// credential, unsupported, an existing completion error) pass through.
    pub fn completion(model: impl Into<String>, prompt: &str, source: LlmError) -> Self {
        match source {
            Self::ModelNotFound { .. }
            | Self::ApiKeyMissing { .. }
            | Self::NotSupported(_)
            | Self::Completion { .. } => source,
            other => Self::Completion {
                model: model.into(),
                prompt: prompt.chars().take(PROMPT_PREVIEW_CHARS).collect(),
                source: Box::new(other),
            },
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::ModelLoad { .. } => "MODEL_LOAD_ERROR",
            Self::Completion { .. } => "COMPLETION_ERROR",
            Self::ApiKeyMissing { .. } => "API_KEY_NOT_CONFIGURED",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::AuthError(_) => "AUTH_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ServerError { .. } => "SERVER_ERROR",
            Self::ApiError(_) => "API_ERROR",
            Self::NetworkError(_) => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Structured details for logging and API responses.
    pub fn details(&self) -> Value {
        match self {
            Self::ModelNotFound { model, provider } => {
                json!({ "model": model, "provider": provider })
            }
            Self::ModelLoad { model, reason } => json!({ "model": model, "reason": reason }),
            Self::Completion {
                model,
                prompt,
                source,
            } => json!({
                "model": model,
                "prompt": prompt,
                "cause": { "code": source.code(), "message": source.to_string() },
            }),
            Self::ApiKeyMissing { provider } => json!({ "provider": provider }),
            Self::ServerError { status, .. } => json!({ "status": status }),
            _ => json!({}),
        }
    }

    /// HTTP status used by the REST facade.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ModelNotFound { .. } => 404,
            Self::ModelLoad { .. } => 502,
            Self::Completion { source, .. } => source.http_status(),
            Self::ApiKeyMissing { .. } => 503,
            Self::NotSupported(_) => 501,
            Self::ConfigError(_) => 500,
            Self::RateLimited(_) => 429,
            Self::AuthError(_) => 401,
            Self::InvalidRequest(_) | Self::SerializationError(_) => 400,
            Self::ServerError { .. } | Self::ApiError(_) | Self::NetworkError(_) => 502,
            Self::Timeout => 504,
        }
    }

    /// Whether a blocking call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_)
            | Self::ServerError { .. }
            | Self::NetworkError(_)
            | Self::Timeout => true,
            Self::Completion { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get a user-friendly description of the error with suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::ModelNotFound { model, .. } => {
                format!("Model '{}' is not available. Run GET /models for the list.", model)
            }
            Self::ModelLoad { model, .. } => {
                format!("Model '{}' could not be loaded. Check the local server.", model)
            }
            Self::Completion { source, .. } => source.user_description(),
            Self::ApiKeyMissing { provider } => {
                format!("Set the API key for '{}' in the environment.", provider)
            }
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this provider.", feature)
            }
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::RateLimited(_) => "Rate limited by the API. Try again shortly.".to_string(),
            Self::AuthError(_) => {
                "Authentication failed. Please check your API key is valid and not expired."
                    .to_string()
            }
            Self::InvalidRequest(msg) => format!("Invalid request: {}. Check your parameters.", msg),
            Self::ServerError { .. } | Self::ApiError(_) => {
                "The provider returned an error. Try again later.".to_string()
            }
            Self::NetworkError(_) => {
                "Unable to connect to the API. Check your network connection.".to_string()
            }
            Self::Timeout => "Request timed out. The server may be overloaded.".to_string(),
            Self::SerializationError(_) => {
                "Failed to parse API response. This may be a temporary issue.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_display() {
        let error = LlmError::RateLimited("too many requests".to_string());
        assert_eq!(error.to_string(), "Rate limit exceeded: too many requests");

        let error = LlmError::ApiKeyMissing {
            provider: "openai".to_string(),
        };
        assert_eq!(error.to_string(), "API key not configured for provider openai");
    }

    // ========================================================================
    // from_status()
    // ========================================================================

    #[test]
    fn test_from_status_classes() {
        assert!(matches!(LlmError::from_status(401, "x"), LlmError::AuthError(_)));
        assert!(matches!(LlmError::from_status(403, "x"), LlmError::AuthError(_)));
        assert!(matches!(LlmError::from_status(429, "x"), LlmError::RateLimited(_)));
        assert!(matches!(
            LlmError::from_status(503, "x"),
            LlmError::ServerError { status: 503, .. }
        ));
        assert!(matches!(LlmError::from_status(422, "x"), LlmError::InvalidRequest(_)));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(LlmError::from_status(429, "").is_retryable());
        assert!(LlmError::from_status(500, "").is_retryable());
        assert!(LlmError::NetworkError("reset".into()).is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(!LlmError::from_status(401, "").is_retryable());
        assert!(!LlmError::from_status(400, "").is_retryable());
        assert!(!LlmError::NotSupported("embed".into()).is_retryable());
    }

    // ========================================================================
    // completion() wrapping
    // ========================================================================

    #[test]
    fn test_completion_wraps_transport_cause() {
        let prompt = "x".repeat(200);
        let error = LlmError::completion("llama3", &prompt, LlmError::from_status(502, "bad"));
        match &error {
            LlmError::Completion { model, prompt, source } => {
                assert_eq!(model, "llama3");
                assert_eq!(prompt.len(), 80);
                assert!(matches!(**source, LlmError::ServerError { status: 502, .. }));
            }
            other => panic!("expected Completion, got {:?}", other),
        }
        assert_eq!(error.code(), "COMPLETION_ERROR");
        assert!(error.is_retryable());
        assert_eq!(error.http_status(), 502);
    }

    #[test]
    fn test_completion_passes_taxonomy_through() {
        let error = LlmError::completion(
            "claude",
            "hi",
            LlmError::ApiKeyMissing {
                provider: "anthropic".into(),
            },
        );
        assert_eq!(error.code(), "API_KEY_NOT_CONFIGURED");
    }

    #[test]
    fn test_details_nest_cause() {
        let error = LlmError::completion("m", "p", LlmError::RateLimited("slow".into()));
        let details = error.details();
        assert_eq!(details["model"], "m");
        assert_eq!(details["cause"]["code"], "RATE_LIMITED");
    }

    #[test]
    fn test_http_status_mapping() {
        let not_found = LlmError::ModelNotFound {
            model: "x".into(),
            provider: "ollama".into(),
        };
        assert_eq!(not_found.http_status(), 404);
        assert_eq!(LlmError::NotSupported("embed".into()).http_status(), 501);
        assert_eq!(LlmError::Timeout.http_status(), 504);
        assert_eq!(
            LlmError::completion("m", "p", LlmError::from_status(429, "")).http_status(),
            429
        );
    }

    #[test]
    fn test_user_description_auth() {
        let error = LlmError::AuthError("invalid key".to_string());
        assert!(error.user_description().contains("API key"));
    }
}
