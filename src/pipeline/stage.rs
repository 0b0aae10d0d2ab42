//! Fan-out of one stage across its participants.

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::{CallContext, GenerateRequest, ProviderGateway};
use crate::patterns::StageKind;
use crate::quality::QualityEvaluator;
use crate::registry::ModelDescriptor;

use super::types::{GenerationOptions, ProviderResponse};

/// Everything needed to call one stage's models once.
pub(crate) struct StageCall<'a> {
    pub run_id: Uuid,
    pub stage: StageKind,
    pub prompt: &'a str,
    pub participants: &'a [&'a ModelDescriptor],
    pub options: &'a GenerationOptions,
    pub deadline: Instant,
}

/// Call every participant concurrently and return once each has answered, failed,
/// or run out of time. Results arrive in completion order.
pub(crate) async fn fan_out(
    gateway: &ProviderGateway,
    quality: &QualityEvaluator,
    call: StageCall<'_>,
) -> Vec<ProviderResponse> {
    let StageCall {
        run_id,
        stage,
        prompt,
        participants,
        options,
        deadline,
    } = call;
    let ctx = CallContext { run_id, stage };

    let tasks = participants.iter().map(move |model| {
        let req = GenerateRequest {
            model_id: model.id.clone(),
            prompt: prompt.to_string(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            timeout: options.timeout(),
        };
        async move {
            let outcome = gateway.call(model, req, ctx, deadline).await;
            match outcome.result {
                Ok(text) => {
                    let score = quality.score(&text);
                    debug!(
                        model = %model.id,
                        stage = %stage,
                        latency_ms = outcome.latency.as_millis() as u64,
                        quality = score,
                        "response received"
                    );
                    ProviderResponse::success(&model.id, stage, text, outcome.latency)
                        .attempts(outcome.attempts)
                        .quality(score)
                }
                Err(err) => {
                    warn!(
                        model = %model.id,
                        stage = %stage,
                        attempts = outcome.attempts,
                        error = %err,
                        "model dropped from stage"
                    );
                    ProviderResponse::failure(&model.id, stage, &err, outcome.latency)
                        .attempts(outcome.attempts)
                }
            }
        }
    });

    stream::iter(tasks)
        .buffer_unordered(participants.len().max(1))
        .collect()
        .await
}
