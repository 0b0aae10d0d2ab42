//! Request, response and result types for a pipeline run.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{ProviderError, ProviderErrorKind};
use crate::patterns::StageKind;

fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_ms() -> u64 {
    60_000
}

/// Per-call generation parameters, shared by every stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per provider call, further bounded by the stage deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl GenerationOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One caller invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    pub selected_model_ids: BTreeSet<String>,
    pub pattern_key: String,
    #[serde(default)]
    pub options: GenerationOptions,
    /// Overrides the configured synthesizer for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_model: Option<String>,
}

impl Request {
    pub fn new<I, S>(prompt: impl Into<String>, models: I, pattern_key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prompt: prompt.into(),
            selected_model_ids: models.into_iter().map(Into::into).collect(),
            pattern_key: pattern_key.into(),
            options: GenerationOptions::default(),
            synthesis_model: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn synthesizer(mut self, model_id: impl Into<String>) -> Self {
        self.synthesis_model = Some(model_id.into());
        self
    }
}

/// Error recorded in place of text for a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl From<&ProviderError> for ResponseError {
    fn from(err: &ProviderError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one model's call within one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub model_id: String,
    pub stage: StageKind,
    /// Empty when `error` is set.
    pub text: String,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ProviderResponse {
    pub fn success(
        model_id: impl Into<String>,
        stage: StageKind,
        text: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            stage,
            text: text.into(),
            latency_ms: latency.as_millis() as u64,
            attempts: 1,
            quality_score: None,
            error: None,
        }
    }

    pub fn failure(
        model_id: impl Into<String>,
        stage: StageKind,
        err: &ProviderError,
        latency: Duration,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            stage,
            text: String::new(),
            latency_ms: latency.as_millis() as u64,
            attempts: 1,
            quality_score: None,
            error: Some(ResponseError::from(err)),
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn quality(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ProviderErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// All responses of one stage, in (priority, model id) order, one per model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub responses: Vec<ProviderResponse>,
}

impl StageResult {
    pub fn successes(&self) -> impl Iterator<Item = &ProviderResponse> {
        self.responses.iter().filter(|r| r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn response(&self, model_id: &str) -> Option<&ProviderResponse> {
        self.responses.iter().find(|r| r.model_id == model_id)
    }

    /// Worth storing: something succeeded and nothing failed for a reason that
    /// may clear up on the next attempt.
    pub fn is_cacheable(&self) -> bool {
        self.success_count() > 0
            && !self
                .responses
                .iter()
                .filter_map(ProviderResponse::error_kind)
                .any(|k| k.is_transient())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    /// A stage produced no usable response; later stages did not run.
    Failed { stage: StageKind },
    /// The overall deadline passed before every stage could start.
    DeadlineExceeded { completed_stages: Vec<StageKind> },
}

impl PipelineStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineStatus::Completed)
    }
}

/// Immutable outcome of a run, returned for every expected failure mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub created_at: String,
    pub request: Request,
    pub stages: Vec<StageResult>,
    pub selected_response: Option<ProviderResponse>,
    pub status: PipelineStatus,
    pub total_latency_ms: u64,
    /// Stages served from the cache without provider calls.
    #[serde(default)]
    pub cache_hits: Vec<StageKind>,
}

impl PipelineResult {
    pub fn stage(&self, stage: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn selected_text(&self) -> Option<&str> {
        self.selected_response.as_ref().map(|r| r.text.as_str())
    }
}
