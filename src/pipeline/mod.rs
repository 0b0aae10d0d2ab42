//! Multi-stage pipeline: types, the stage orchestrator and result assembly.

mod aggregate;
mod orchestrator;
mod stage;
mod types;

pub use aggregate::{select_response, ResultAggregator};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError, OrchestratorSettings};
pub use types::{
    GenerationOptions, PipelineResult, PipelineStatus, ProviderResponse, Request, ResponseError,
    StageResult,
};
