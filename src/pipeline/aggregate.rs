//! Result assembly and cache population.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Fingerprint, StageCache};
use crate::patterns::StageKind;
use crate::registry::ModelRegistry;

use super::types::{PipelineResult, PipelineStatus, ProviderResponse, Request, StageResult};

#[derive(Clone)]
pub struct ResultAggregator {
    cache: Option<Arc<dyn StageCache>>,
    ttl: Duration,
}

impl ResultAggregator {
    pub fn new(cache: Option<Arc<dyn StageCache>>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Cached result for `fingerprint`. A faulty store counts as a miss.
    pub async fn cached(&self, fingerprint: &Fingerprint) -> Option<StageResult> {
        let cache = self.cache.as_ref()?;
        match cache.get(fingerprint).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Store a finished stage right away so a later failure cannot discard it.
    /// Returns whether the result was written.
    pub async fn record_stage(&self, fingerprint: &Fingerprint, result: &StageResult) -> bool {
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        if !result.is_cacheable() {
            debug!(fingerprint = %fingerprint, stage = %result.stage, "stage not cacheable");
            return false;
        }
        match cache.put(fingerprint, result, self.ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cache write failed");
                false
            }
        }
    }

    /// Order responses by (priority, model id), keeping one per model.
    pub fn normalize(
        stage: StageKind,
        mut responses: Vec<ProviderResponse>,
        registry: &ModelRegistry,
    ) -> StageResult {
        let priority = |id: &str| registry.resolve(id).map(|m| m.priority).unwrap_or(u32::MAX);
        responses.sort_by(|a, b| {
            (priority(&a.model_id), a.model_id.as_str())
                .cmp(&(priority(&b.model_id), b.model_id.as_str()))
        });
        responses.dedup_by(|a, b| a.model_id == b.model_id);
        StageResult { stage, responses }
    }

    pub fn assemble(
        &self,
        run_id: Uuid,
        request: Request,
        stages: Vec<StageResult>,
        status: PipelineStatus,
        cache_hits: Vec<StageKind>,
        started: Instant,
    ) -> PipelineResult {
        let selected_response = select_response(&stages);
        PipelineResult {
            run_id,
            created_at: Utc::now().to_rfc3339(),
            request,
            stages,
            selected_response,
            status,
            total_latency_ms: started.elapsed().as_millis() as u64,
            cache_hits,
        }
    }
}

/// The SYNTHESIS answer if it succeeded, else the best-scoring INITIAL success.
///
/// Responses are already in priority order, so the first of equal scores wins.
pub fn select_response(stages: &[StageResult]) -> Option<ProviderResponse> {
    let synthesized = stages
        .iter()
        .find(|s| s.stage == StageKind::Synthesis)
        .and_then(|s| s.successes().next());
    if let Some(resp) = synthesized {
        return Some(resp.clone());
    }

    let initial = stages.iter().find(|s| s.stage == StageKind::Initial)?;
    let mut best: Option<&ProviderResponse> = None;
    for resp in initial.successes() {
        let score = resp.quality_score.unwrap_or(0.0);
        match best {
            Some(b) if b.quality_score.unwrap_or(0.0) >= score => {}
            _ => best = Some(resp),
        }
    }
    best.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ProviderError;
    use crate::registry::ModelDescriptor;

    fn registry() -> ModelRegistry {
        ModelRegistry::from_descriptors(
            vec![
                ModelDescriptor::new("slow", "alpha", 3),
                ModelDescriptor::new("mid", "beta", 2),
                ModelDescriptor::new("top", "alpha", 1),
            ],
            1,
        )
        .unwrap()
    }

    fn ok(model: &str, stage: StageKind, score: f64) -> ProviderResponse {
        ProviderResponse::success(model, stage, format!("{model} says"), Duration::ZERO)
            .quality(score)
    }

    #[test]
    fn normalize_sorts_by_priority_and_dedups() {
        let responses = vec![
            ok("slow", StageKind::Initial, 0.1),
            ok("top", StageKind::Initial, 0.1),
            ok("mid", StageKind::Initial, 0.1),
            ok("top", StageKind::Initial, 0.9),
        ];
        let result = ResultAggregator::normalize(StageKind::Initial, responses, &registry());
        let ids: Vec<&str> = result.responses.iter().map(|r| r.model_id.as_str()).collect();
        assert_eq!(ids, vec!["top", "mid", "slow"]);
    }

    #[test]
    fn selection_prefers_synthesis_then_quality_then_priority() {
        let initial = StageResult {
            stage: StageKind::Initial,
            responses: vec![
                ok("top", StageKind::Initial, 0.5),
                ok("mid", StageKind::Initial, 0.8),
                ok("slow", StageKind::Initial, 0.8),
            ],
        };
        let failed_synthesis = StageResult {
            stage: StageKind::Synthesis,
            responses: vec![ProviderResponse::failure(
                "top",
                StageKind::Synthesis,
                &ProviderError::unavailable("down"),
                Duration::ZERO,
            )],
        };
        let picked = select_response(&[initial.clone(), failed_synthesis]).unwrap();
        assert_eq!(picked.model_id, "mid");

        let synthesis = StageResult {
            stage: StageKind::Synthesis,
            responses: vec![ok("top", StageKind::Synthesis, 0.1)],
        };
        let picked = select_response(&[initial, synthesis]).unwrap();
        assert_eq!(picked.stage, StageKind::Synthesis);

        assert!(select_response(&[]).is_none());
    }
}
