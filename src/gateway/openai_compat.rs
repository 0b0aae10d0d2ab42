//! Adapter for OpenAI-compatible chat completion backends.
//!
//! One instance serves one provider family; several families (e.g. "openai",
//! "openrouter", "deepseek") can each get their own instance with a different base URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::{GenerateRequest, ProviderAdapter};

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed prompt size in bytes.
const MAX_INPUT_BYTES: usize = 500_000;

/// Retry-After used for a 429 that does not carry the header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    family: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatAdapter {
    /// Build an adapter for `family` talking to `base_url` with a bearer key.
    ///
    /// `client_timeout` is the transport ceiling; per-call timeouts from the gateway
    /// are usually tighter.
    pub fn new(
        family: impl Into<String>,
        api_key: &str,
        base_url: impl Into<String>,
        client_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::unauthorized("invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(client_timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::unavailable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            family: family.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Read the API key from `api_key_env`.
    pub fn from_env(
        family: impl Into<String>,
        api_key_env: &str,
        base_url: impl Into<String>,
        client_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| ProviderError::unauthorized(format!("{api_key_env} not set")))?;
        Self::new(family, &api_key, base_url, client_timeout)
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn retry_after(headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }

    fn classify_status(
        status: u16,
        message: String,
        retry_after: Duration,
        ctx: ErrorContext,
    ) -> ProviderError {
        match status {
            401 | 403 => ProviderError::unauthorized(message).with_context(ctx),
            429 => ProviderError::rate_limited_remote(retry_after, ctx),
            500..=599 => ProviderError::unavailable(message).with_context(ctx),
            _ => ProviderError::invalid_response(message).with_context(ctx),
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 1],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

// =============================================================================
// ADAPTER IMPL
// =============================================================================

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn family(&self) -> &str {
        &self.family
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<String, ProviderError> {
        if req.prompt.len() > MAX_INPUT_BYTES {
            return Err(ProviderError::invalid_response(format!(
                "prompt too large: {} bytes (max {MAX_INPUT_BYTES})",
                req.prompt.len()
            )));
        }

        let api_req = ChatApiRequest {
            model: &req.model_id,
            messages: [ApiMessage {
                role: "user",
                content: &req.prompt,
            }],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .timeout(req.timeout)
            .json(&api_req)
            .send()
            .await
            .map_err(|e| match ProviderError::from(e) {
                ProviderError::Timeout(_) => ProviderError::Timeout(req.timeout),
                other => other,
            })?;

        let status = response.status();
        let headers = response.headers().clone();

        // Stream the body to enforce the size limit.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::invalid_response(format!(
                    "response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match Self::extract_request_id(&headers) {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let parsed_error = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let (message, ctx) = match parsed_error {
                Some(error) => {
                    let ctx = match error.code {
                        Some(serde_json::Value::String(code)) => ctx.with_code(code),
                        Some(other) => ctx.with_code(other.to_string()),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };
            return Err(Self::classify_status(
                status.as_u16(),
                message,
                Self::retry_after(&headers),
                ctx,
            ));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::invalid_response(format!("invalid JSON: {e}")).with_context(ctx.clone())
        })?;

        if let Some(error) = parsed.error {
            return Err(
                ProviderError::invalid_response(error.message.unwrap_or_default())
                    .with_context(ctx),
            );
        }

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(
                ProviderError::invalid_response("empty completion content").with_context(ctx)
            );
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ProviderErrorKind;

    #[test]
    fn status_classification_matches_error_taxonomy() {
        let ra = Duration::from_secs(5);
        let kind = |s| {
            OpenAiCompatAdapter::classify_status(s, "m".into(), ra, ErrorContext::new()).kind()
        };
        assert_eq!(kind(401), ProviderErrorKind::Unauthorized);
        assert_eq!(kind(403), ProviderErrorKind::Unauthorized);
        assert_eq!(kind(429), ProviderErrorKind::RateLimited);
        assert_eq!(kind(500), ProviderErrorKind::Unavailable);
        assert_eq!(kind(503), ProviderErrorKind::Unavailable);
        assert_eq!(kind(400), ProviderErrorKind::InvalidResponse);
        assert_eq!(kind(404), ProviderErrorKind::InvalidResponse);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let adapter = OpenAiCompatAdapter::new(
            "openai",
            "sk-test",
            "http://localhost:1234/v1/",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(adapter.chat_url(), "http://localhost:1234/v1/chat/completions");
    }

    #[tokio::test]
    async fn prompt_limit_counts_bytes() {
        let adapter = OpenAiCompatAdapter::new(
            "openai",
            "sk-test",
            "http://127.0.0.1:9",
            Duration::from_secs(1),
        )
        .unwrap();
        // Two bytes per char: under the limit in chars, over it in bytes.
        let prompt = "é".repeat(MAX_INPUT_BYTES / 2 + 1);
        assert!(prompt.chars().count() < MAX_INPUT_BYTES);

        let err = adapter
            .generate(&GenerateRequest {
                model_id: "m".into(),
                prompt,
                temperature: 0.0,
                max_tokens: None,
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProviderErrorKind::InvalidResponse);
        assert!(err.to_string().contains("bytes"));
    }
}
