//! Pipeline domain: planning, pacing queue, executor, consistency gate, drift, run.
//! `run` is the single entry point; the other modules stay usable on their own.

pub mod drift;
pub mod executor;
pub mod gate;
pub mod plan;
pub mod queue;
pub mod run;

pub use drift::{aggregate, DriftConfig, DriftReport, DriftSummary, RoleDrift};
pub use executor::{
    ExecutionContext, ExecutorConfig, GenerationExecutor, GenerationSubmitter, PanelResult,
    PanelStatus, QueuedGeneration,
};
pub use gate::{
    ConsistencyGate, ConsistencyRecord, GateCandidate, GateConfig, GateOutcome, GateState,
    PanelRegenerator, StrictFallback,
};
pub use plan::{normalize_roles, GenerationJob, GenerationPlan, JobPlanner, PlanCorrection, PlanOptions};
pub use queue::{
    PacingConfig, PacingQueue, Priority, QueueEventContext, QueueStats, RateLimitSnapshot,
    RequestId, SubmitContext,
};
pub use run::{
    Pipeline, PipelineOutcome, PipelineServices, PipelineSettings, RunFailure, RunOptions,
    RunSuccess,
};
