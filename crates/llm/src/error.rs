use thiserror::Error;

/// Structured error returned by an [`crate::LlmExecutor`].
///
/// The run engine only looks at two facets of a failed generation:
/// [`LlmError::status_code`] and [`LlmError::is_retryable`]. Everything
/// else is provider detail carried for diagnostics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LlmError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server-provided wait hint, when the provider sent one.
        retry_after_secs: Option<u64>,
    },

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response format error: {message}")]
    ResponseFormat { message: String },

    #[error("http error{}: {message}", status_code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Http {
        status_code: Option<u16>,
        message: String,
    },

    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// HTTP status associated with this failure, when one applies.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::RateLimited { .. } => Some(429),
            LlmError::Overloaded(_) => Some(529),
            LlmError::Timeout { .. } => Some(408),
            LlmError::Auth(_) => Some(401),
            LlmError::InvalidRequest(_) => Some(400),
            LlmError::Http { status_code, .. } => *status_code,
            LlmError::ResponseFormat { .. } | LlmError::Provider(_) => None,
        }
    }

    /// Whether retrying the same request can reasonably succeed.
    ///
    /// Rate limits, overload, timeouts and 5xx responses are transient;
    /// auth and request-shape failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Overloaded(_) | LlmError::Timeout { .. } => {
                true
            }
            LlmError::Http { status_code, .. } => status_code.is_none_or(|c| c >= 500),
            LlmError::Auth(_)
            | LlmError::InvalidRequest(_)
            | LlmError::ResponseFormat { .. }
            | LlmError::Provider(_) => false,
        }
    }

    /// Server-provided wait hint, when the provider sent one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
