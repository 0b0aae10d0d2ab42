//! Stage orchestrator: drives INITIAL → META → SYNTHESIS → [REFLECTION].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{Fingerprint, SingleFlight, StageCache};
use crate::gateway::{AdapterSet, NoopUsageSink, ProviderGateway, RetryPolicy, UsageSink};
use crate::patterns::{
    PatternDefinition, PatternError, RenderInput, ResponseView, StageKind, StageView,
    TemplateEngine,
};
use crate::quality::QualityEvaluator;
use crate::rate_limit::RateLimiter;
use crate::registry::{ModelDescriptor, ModelRegistry, RegistryError};

use super::aggregate::ResultAggregator;
use super::stage::{fan_out, StageCall};
use super::types::{PipelineResult, PipelineStatus, Request, StageResult};

// =============================================================================
// Settings and errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub stage_deadline_ms: u64,
    pub pipeline_deadline_ms: u64,
    /// Default synthesizer; falls back to the highest-priority enabled model.
    pub synthesis_model: Option<String>,
    /// Wait (within the stage deadline) for rate-limit tokens instead of skipping.
    pub wait_for_rate_limit: bool,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stage_deadline_ms: 120_000,
            pipeline_deadline_ms: 600_000,
            synthesis_model: None,
            wait_for_rate_limit: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn stage_deadline(&self) -> Duration {
        Duration::from_millis(self.stage_deadline_ms)
    }

    pub fn pipeline_deadline(&self) -> Duration {
        Duration::from_millis(self.pipeline_deadline_ms)
    }
}

/// Hard failures only: the run could not start. Provider trouble never surfaces here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

// =============================================================================
// Builder
// =============================================================================

pub struct OrchestratorBuilder {
    registry: ModelRegistry,
    adapters: AdapterSet,
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<dyn StageCache>>,
    cache_ttl: Duration,
    quality: QualityEvaluator,
    templates: TemplateEngine,
    usage_sink: Arc<dyn UsageSink>,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    /// Defaults to one bucket per enabled model, sized from the registry.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn StageCache>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn quality(mut self, quality: QualityEvaluator) -> Self {
        self.quality = quality;
        self
    }

    pub fn templates(mut self, templates: TemplateEngine) -> Self {
        self.templates = templates;
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = sink;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fails when an enabled family has no adapter or the configured synthesizer
    /// cannot be resolved.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.registry.validate_adapters(&self.adapters)?;
        if let Some(id) = &self.settings.synthesis_model {
            self.registry.resolve(id)?;
        }

        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::from_registry(&self.registry)));
        let gateway = ProviderGateway::new(
            self.adapters,
            limiter,
            self.settings.retry.clone(),
            self.usage_sink,
        )
        .wait_for_rate_limit(self.settings.wait_for_rate_limit);

        Ok(Orchestrator {
            registry: self.registry,
            gateway,
            templates: self.templates,
            quality: self.quality,
            aggregator: ResultAggregator::new(self.cache, self.cache_ttl),
            flights: SingleFlight::new(),
            settings: self.settings,
        })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Validated request, resolved against the registry.
struct RunPlan<'a> {
    pattern: &'a PatternDefinition,
    pattern_digest: String,
    /// Selected models in (priority, id) order.
    models: Vec<&'a ModelDescriptor>,
    synthesizer: Option<&'a ModelDescriptor>,
}

/// What one stage produced for the run loop.
enum StageRun {
    Done { result: StageResult, cached: bool },
    /// The pipeline deadline ran out before the stage yielded a usable response.
    OutOfTime,
}

pub struct Orchestrator {
    registry: ModelRegistry,
    gateway: ProviderGateway,
    templates: TemplateEngine,
    quality: QualityEvaluator,
    aggregator: ResultAggregator,
    flights: SingleFlight,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn builder(registry: ModelRegistry, adapters: AdapterSet) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            adapters,
            limiter: None,
            cache: None,
            cache_ttl: Duration::from_secs(24 * 3_600),
            quality: QualityEvaluator::default(),
            templates: TemplateEngine::builtin(),
            usage_sink: Arc::new(NoopUsageSink),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.gateway.limiter()
    }

    /// Run every stage of the request's pattern.
    ///
    /// Returns `Err` only when the request cannot run at all. Provider failures,
    /// an exhausted stage and the overall deadline all produce a `PipelineResult`
    /// whose `status` says what happened.
    pub async fn run(&self, request: Request) -> Result<PipelineResult, OrchestratorError> {
        let plan = self.plan(&request)?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let pipeline_deadline = started + self.settings.pipeline_deadline();

        info!(
            run_id = %run_id,
            pattern = %plan.pattern.key,
            models = plan.models.len(),
            "pipeline started"
        );

        let mut stages: Vec<StageResult> = Vec::with_capacity(plan.pattern.stages.len());
        let mut cache_hits: Vec<StageKind> = Vec::new();
        let mut status = PipelineStatus::Completed;

        for &stage in &plan.pattern.stages {
            let outcome = if Instant::now() >= pipeline_deadline {
                StageRun::OutOfTime
            } else {
                self.execute_stage(&request, &plan, stage, &stages, run_id, pipeline_deadline)
                    .await?
            };
            let (result, cached) = match outcome {
                StageRun::Done { result, cached } => (result, cached),
                StageRun::OutOfTime => {
                    warn!(run_id = %run_id, stage = %stage, "pipeline deadline passed");
                    status = PipelineStatus::DeadlineExceeded {
                        completed_stages: stages.iter().map(|s| s.stage).collect(),
                    };
                    break;
                }
            };
            let successes = result.success_count();
            info!(
                run_id = %run_id,
                stage = %stage,
                responses = result.responses.len(),
                successes,
                cached,
                "stage complete"
            );
            if cached {
                cache_hits.push(stage);
            }
            stages.push(result);

            if successes == 0 {
                warn!(run_id = %run_id, stage = %stage, "no usable response; stopping");
                status = PipelineStatus::Failed { stage };
                break;
            }
        }

        let result = self
            .aggregator
            .assemble(run_id, request, stages, status, cache_hits, started);
        info!(
            run_id = %run_id,
            status = ?result.status,
            latency_ms = result.total_latency_ms,
            "pipeline finished"
        );
        Ok(result)
    }

    fn plan<'a>(&'a self, request: &Request) -> Result<RunPlan<'a>, OrchestratorError> {
        if request.prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "prompt must not be empty".into(),
            ));
        }
        if request.selected_model_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "at least one model must be selected".into(),
            ));
        }

        let pattern = self.templates.get(&request.pattern_key)?;

        let mut models = request
            .selected_model_ids
            .iter()
            .map(|id| self.registry.resolve(id))
            .collect::<Result<Vec<_>, _>>()?;
        models.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

        if pattern.has_stage(StageKind::Meta) && !models.iter().any(|m| m.meta_capable) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "pattern '{}' needs a meta-capable model among the selection",
                pattern.key
            )));
        }

        let needs_synthesizer =
            pattern.has_stage(StageKind::Synthesis) || pattern.has_stage(StageKind::Reflection);
        let synthesizer = if needs_synthesizer {
            Some(self.synthesizer(request)?)
        } else {
            None
        };

        Ok(RunPlan {
            pattern,
            pattern_digest: pattern.content_hash(),
            models,
            synthesizer,
        })
    }

    /// Request override, then configured default, then highest-priority enabled.
    fn synthesizer(&self, request: &Request) -> Result<&ModelDescriptor, OrchestratorError> {
        let configured = request
            .synthesis_model
            .as_deref()
            .or(self.settings.synthesis_model.as_deref());
        match configured {
            Some(id) => Ok(self.registry.resolve(id)?),
            None => self.registry.highest_priority_enabled().ok_or_else(|| {
                OrchestratorError::InvalidRequest("no enabled model can synthesize".into())
            }),
        }
    }

    /// Serve one stage from the cache or compute it, at most once per fingerprint.
    ///
    /// The stage deadline starts once the single-flight gate is held, so a run that
    /// queued behind an identical one still gets its full budget. Waiting for the
    /// gate, and the stage itself, never outlive `pipeline_deadline`.
    async fn execute_stage(
        &self,
        request: &Request,
        plan: &RunPlan<'_>,
        stage: StageKind,
        prior: &[StageResult],
        run_id: Uuid,
        pipeline_deadline: Instant,
    ) -> Result<StageRun, OrchestratorError> {
        let participants = participants(plan, stage, prior);
        let consumed = consumed(stage, prior);

        let input = render_input(request, stage, &consumed, prior);
        let prompt = self.templates.render(plan.pattern, stage, &input)?;

        let fingerprint = Fingerprint::builder(&request.prompt, &plan.pattern.key, stage)
            .pattern_digest(&plan.pattern_digest)
            .selected(request.selected_model_ids.iter().map(String::as_str))
            .options(request.options.temperature, request.options.max_tokens)
            .participants(participants.iter().map(|m| m.id.as_str()))
            .upstream(consumed.iter().copied())
            .build();

        if let Some(hit) = self.aggregator.cached(&fingerprint).await {
            return Ok(StageRun::Done {
                result: hit,
                cached: true,
            });
        }
        let _flight = if self.aggregator.has_cache() {
            let Ok(guard) = timeout_at(pipeline_deadline, self.flights.acquire(&fingerprint)).await
            else {
                return Ok(StageRun::OutOfTime);
            };
            // Whoever held the gate before us may have filled the cache.
            if let Some(hit) = self.aggregator.cached(&fingerprint).await {
                return Ok(StageRun::Done {
                    result: hit,
                    cached: true,
                });
            }
            Some(guard)
        } else {
            None
        };

        let stage_deadline = Instant::now() + self.settings.stage_deadline();
        let clamped = stage_deadline > pipeline_deadline;
        let deadline = stage_deadline.min(pipeline_deadline);

        let responses = fan_out(
            &self.gateway,
            &self.quality,
            StageCall {
                run_id,
                stage,
                prompt: &prompt,
                participants: &participants,
                options: &request.options,
                deadline,
            },
        )
        .await;
        let result = ResultAggregator::normalize(stage, responses, &self.registry);
        self.aggregator.record_stage(&fingerprint, &result).await;

        // Cut off by the overall deadline with nothing to show: not a stage failure.
        if clamped && result.success_count() == 0 && Instant::now() >= pipeline_deadline {
            return Ok(StageRun::OutOfTime);
        }
        Ok(StageRun::Done {
            result,
            cached: false,
        })
    }
}

fn stage_result(prior: &[StageResult], stage: StageKind) -> Option<&StageResult> {
    prior.iter().find(|s| s.stage == stage)
}

/// Models called in `stage`, in priority order.
fn participants<'a>(
    plan: &RunPlan<'a>,
    stage: StageKind,
    prior: &[StageResult],
) -> Vec<&'a ModelDescriptor> {
    match stage {
        StageKind::Initial => plan.models.clone(),
        StageKind::Meta => {
            let initial = stage_result(prior, StageKind::Initial);
            plan.models
                .iter()
                .copied()
                .filter(|m| m.meta_capable)
                .filter(|m| {
                    initial
                        .and_then(|s| s.response(&m.id))
                        .is_some_and(|r| r.is_success())
                })
                .collect()
        }
        StageKind::Synthesis | StageKind::Reflection => plan.synthesizer.into_iter().collect(),
    }
}

/// Prior results whose text feeds `stage`'s prompt.
fn consumed(stage: StageKind, prior: &[StageResult]) -> Vec<&StageResult> {
    match stage {
        StageKind::Initial => Vec::new(),
        StageKind::Meta => stage_result(prior, StageKind::Initial).into_iter().collect(),
        StageKind::Synthesis => stage_result(prior, StageKind::Meta)
            .or_else(|| stage_result(prior, StageKind::Initial))
            .into_iter()
            .collect(),
        StageKind::Reflection => prior.iter().collect(),
    }
}

fn views(result: &StageResult) -> Vec<ResponseView<'_>> {
    result
        .successes()
        .map(|r| ResponseView {
            model_id: &r.model_id,
            text: &r.text,
        })
        .collect()
}

fn render_input<'a>(
    request: &'a Request,
    stage: StageKind,
    consumed: &[&'a StageResult],
    prior: &'a [StageResult],
) -> RenderInput<'a> {
    let responses = match stage {
        StageKind::Reflection => stage_result(prior, StageKind::Synthesis)
            .map(views)
            .unwrap_or_default(),
        _ => consumed.iter().copied().flat_map(views).collect(),
    };
    let transcript = if stage == StageKind::Reflection {
        prior
            .iter()
            .map(|s| StageView {
                stage: s.stage,
                responses: views(s),
            })
            .collect()
    } else {
        Vec::new()
    };
    RenderInput {
        prompt: &request.prompt,
        responses,
        transcript,
    }
}
