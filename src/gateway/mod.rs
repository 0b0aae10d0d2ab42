//! Provider gateway: the uniform adapter interface plus the single retry/timeout
//! policy every provider call goes through.

pub mod error;
pub mod openai_compat;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::patterns::StageKind;
use crate::rate_limit::RateLimiter;
use crate::registry::ModelDescriptor;

pub use error::{ErrorContext, ProviderError, ProviderErrorKind};
pub use openai_compat::OpenAiCompatAdapter;
pub use usage::{
    CallStatus, JsonlUsageSink, NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageError,
    UsageSink, UsageWorker,
};

// =============================================================================
// ADAPTER TRAIT
// =============================================================================

/// One outbound generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Backend model identifier (the registry id).
    pub model_id: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Per-call timeout requested by the caller.
    pub timeout: Duration,
}

/// Uniform capability wrapping one concrete backend.
///
/// Implementations perform exactly one outbound call per `generate` and never retry;
/// retries belong to [`ProviderGateway`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider family this adapter serves (matches `ModelDescriptor::family`).
    fn family(&self) -> &str;

    async fn generate(&self, req: &GenerateRequest) -> Result<String, ProviderError>;
}

/// Adapters registered by provider family.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own family name. A later registration for the
    /// same family replaces the earlier one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.family().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, family: &str) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(family)
    }

    pub fn contains(&self, family: &str) -> bool {
        self.adapters.contains_key(family)
    }

    pub fn families(&self) -> Vec<String> {
        let mut families: Vec<String> = self.adapters.keys().cloned().collect();
        families.sort();
        families
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, err: &ProviderError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }

    /// Exponential backoff for the given zero-based attempt, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.pow(attempt.min(16));
        let ms = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Where a call sits in a pipeline run, for usage attribution.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub run_id: Uuid,
    pub stage: StageKind,
}

/// Result of a model call after the retry policy has been applied.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub result: Result<String, ProviderError>,
    /// Number of attempts that reached the adapter or the rate limiter.
    pub attempts: u32,
    pub latency: Duration,
}

/// Routes each call to the adapter registered for the model's family, through the
/// per-model rate limiter, bounded by a deadline, retrying per [`RetryPolicy`].
pub struct ProviderGateway {
    adapters: AdapterSet,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    usage_sink: Arc<dyn UsageSink>,
    wait_for_rate_limit: bool,
}

impl ProviderGateway {
    pub fn new(
        adapters: AdapterSet,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            adapters,
            limiter,
            retry,
            usage_sink,
            wait_for_rate_limit: false,
        }
    }

    /// Wait for a rate-limit token (bounded by the deadline) instead of skipping.
    pub fn wait_for_rate_limit(mut self, wait: bool) -> Self {
        self.wait_for_rate_limit = wait;
        self
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn call(
        &self,
        model: &ModelDescriptor,
        req: GenerateRequest,
        ctx: CallContext,
        deadline: Instant,
    ) -> CallOutcome {
        let start = Instant::now();

        let Some(adapter) = self.adapters.get(&model.family) else {
            // Registry validation rejects this at startup; kept as a hard error, not a skip.
            return CallOutcome {
                result: Err(ProviderError::invalid_response(format!(
                    "no adapter registered for family '{}'",
                    model.family
                ))),
                attempts: 0,
                latency: start.elapsed(),
            };
        };

        let mut attempt: u32 = 0;
        let mut last_err: Option<ProviderError> = None;
        loop {
            let attempt_start = Instant::now();
            let result = match self.acquire_token(model, deadline).await {
                Ok(()) => self.attempt(adapter.as_ref(), &req, deadline).await,
                Err(denied) => match last_err.take() {
                    // A refused retry is not an attempt; the provider error stands.
                    Some(err) => {
                        debug!(
                            model = %model.id,
                            reason = %denied,
                            "retry refused before dispatch"
                        );
                        return CallOutcome {
                            result: Err(err),
                            attempts: attempt,
                            latency: start.elapsed(),
                        };
                    }
                    None => Err(denied),
                },
            };
            attempt += 1;

            self.record(model, ctx, attempt, attempt_start.elapsed(), &result)
                .await;

            match result {
                Ok(text) => {
                    return CallOutcome {
                        result: Ok(text),
                        attempts: attempt,
                        latency: start.elapsed(),
                    };
                }
                Err(err) => {
                    if !self.retry.should_retry(&err, attempt - 1) {
                        return CallOutcome {
                            result: Err(err),
                            attempts: attempt,
                            latency: start.elapsed(),
                        };
                    }
                    let wake = Instant::now() + self.retry.backoff_delay(attempt - 1);
                    if wake >= deadline {
                        debug!(model = %model.id, "backoff would pass the deadline, giving up");
                        return CallOutcome {
                            result: Err(err),
                            attempts: attempt,
                            latency: start.elapsed(),
                        };
                    }
                    warn!(
                        model = %model.id,
                        stage = %ctx.stage,
                        attempt,
                        error = %err,
                        "retrying provider call"
                    );
                    last_err = Some(err);
                    sleep_until(wake).await;
                }
            }
        }
    }

    /// Deadline check plus one rate-limit token for `model`.
    async fn acquire_token(
        &self,
        model: &ModelDescriptor,
        deadline: Instant,
    ) -> Result<(), ProviderError> {
        if Instant::now() >= deadline {
            return Err(ProviderError::Timeout(Duration::ZERO));
        }
        if self.wait_for_rate_limit {
            self.limiter
                .acquire_before(&model.id, deadline)
                .await
                .map_err(ProviderError::rate_limited_local)
        } else {
            self.limiter
                .try_acquire(&model.id)
                .map_err(ProviderError::rate_limited_local)
        }
    }

    async fn attempt(
        &self,
        adapter: &dyn ProviderAdapter,
        req: &GenerateRequest,
        deadline: Instant,
    ) -> Result<String, ProviderError> {
        let call_deadline = (Instant::now() + req.timeout).min(deadline);
        let allowed = call_deadline.saturating_duration_since(Instant::now());
        match timeout_at(call_deadline, adapter.generate(req)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(ProviderError::Timeout(_))) => Err(ProviderError::Timeout(allowed)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ProviderError::Timeout(allowed)),
        }
    }

    async fn record(
        &self,
        model: &ModelDescriptor,
        ctx: CallContext,
        attempt: u32,
        latency: Duration,
        result: &Result<String, ProviderError>,
    ) {
        let record = ProviderCallRecord::new(&model.family, &model.id, ctx.stage)
            .run(ctx.run_id)
            .attempt(attempt)
            .latency(latency.as_millis() as u64);

        let record = match result {
            Ok(text) => record.output_chars(text.chars().count()),
            Err(err) => {
                let record = record.error(err.code());
                match err.request_id() {
                    Some(id) => record.request_id(id),
                    None => record,
                }
            }
        };

        self.usage_sink.record(record).await;
    }
}
