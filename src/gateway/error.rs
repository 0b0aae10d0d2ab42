//! Error types for provider adapters.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// HTTP status code from the backend.
    pub http_status: Option<u16>,
    /// Backend-specific error code (e.g. "invalid_api_key").
    pub provider_code: Option<String>,
    /// Request ID from the backend (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors a provider adapter can return from a single `generate` call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Credentials rejected. Permanent.
    #[error("unauthorized: {message}")]
    Unauthorized {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Rate limited, either by the local bucket or by a remote 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// The call (or the stage deadline) elapsed before a response arrived.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The backend answered, but not with usable text. Permanent.
    #[error("invalid response: {message}")]
    InvalidResponse {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Backend unreachable or failing (5xx, connection refused).
    #[error("unavailable: {message}")]
    Unavailable {
        message: String,
        context: Option<ErrorContext>,
    },
}

/// Payload-free tag of a [`ProviderError`], stored in responses and cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Unauthorized,
    RateLimited,
    Timeout,
    InvalidResponse,
    Unavailable,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidResponse => "invalid_response",
            Self::Unavailable => "unavailable",
        }
    }

    /// Errors that may clear up on their own and so must not be pinned in the cache.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProviderError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
            context: None,
        }
    }

    /// Rate limit imposed by our own bucket.
    pub fn rate_limited_local(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            context: None,
        }
    }

    /// Rate limit reported by the backend.
    pub fn rate_limited_remote(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
            context: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            context: None,
        }
    }

    /// Attach context to variants that carry it. `Timeout` is returned unchanged.
    pub fn with_context(self, ctx: ErrorContext) -> Self {
        match self {
            Self::Unauthorized { message, .. } => Self::Unauthorized {
                message,
                context: Some(ctx),
            },
            Self::RateLimited { retry_after, .. } => Self::RateLimited {
                retry_after,
                context: Some(ctx),
            },
            Self::InvalidResponse { message, .. } => Self::InvalidResponse {
                message,
                context: Some(ctx),
            },
            Self::Unavailable { message, .. } => Self::Unavailable {
                message,
                context: Some(ctx),
            },
            other @ Self::Timeout(_) => other,
        }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Unauthorized { .. } => ProviderErrorKind::Unauthorized,
            Self::RateLimited { .. } => ProviderErrorKind::RateLimited,
            Self::Timeout(_) => ProviderErrorKind::Timeout,
            Self::InvalidResponse { .. } => ProviderErrorKind::InvalidResponse,
            Self::Unavailable { .. } => ProviderErrorKind::Unavailable,
        }
    }

    /// Only timeouts and unavailability are retried; nothing else self-resolves
    /// within a single stage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable { .. })
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Unauthorized { context, .. } => context.as_ref(),
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::InvalidResponse { context, .. } => context.as_ref(),
            Self::Unavailable { context, .. } => context.as_ref(),
            Self::Timeout(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Timeout(Duration::ZERO);
        }
        if err.is_decode() {
            return ProviderError::invalid_response(err.to_string());
        }
        ProviderError::unavailable(err.to_string())
    }
}
