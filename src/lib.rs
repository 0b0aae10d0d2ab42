#![forbid(unsafe_code)]

//! # ensemble-harness
//!
//! Ask several language models the same question, let them critique each other,
//! and fold the result into one answer.
//!
//! A run fans the prompt out to every selected model (INITIAL), asks the
//! meta-capable ones to review the answers (META), has one designated model
//! combine the reviews (SYNTHESIS), and optionally reviews the whole transcript
//! (REFLECTION). Every provider call goes through a per-model rate limiter and a
//! single retry/timeout policy. Stage results are cached by fingerprint, and a
//! failing provider only drops that model from the stage.
//!
//! The caller always gets a [`PipelineResult`] back for provider-side failures;
//! only configuration and request-validation problems are errors.

pub mod cache;
pub mod config;
pub mod gateway;
pub mod patterns;
pub mod pipeline;
pub mod quality;
pub mod rate_limit;
pub mod registry;

pub use cache::{Fingerprint, MemoryStageCache, SingleFlight, SqliteStageCache, StageCache};
pub use config::{ConfigError, EnsembleConfig};
pub use gateway::{
    AdapterSet, GenerateRequest, OpenAiCompatAdapter, ProviderAdapter, ProviderError,
    ProviderErrorKind, ProviderGateway, RetryPolicy, UsageSink,
};
pub use patterns::{PatternDefinition, StageKind, TemplateEngine};
pub use pipeline::{
    Orchestrator, OrchestratorError, OrchestratorSettings, PipelineResult, PipelineStatus,
    ProviderResponse, Request, StageResult,
};
pub use quality::{QualityEvaluator, QualityWeights};
pub use rate_limit::RateLimiter;
pub use registry::{ModelDescriptor, ModelRegistry, RegistryError};
