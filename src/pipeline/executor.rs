//! Generation executor: runs one job through the pacing queue with bounded retries.
//! Queue pacing and throttle handling stay in the queue; this layer owns attempt
//! counting, backoff between attempts and the anchor fail-fast rule.

use crate::design::DesignSpecification;
use crate::error::{PipelineError, ServiceError};
use crate::pipeline::plan::GenerationJob;
use crate::pipeline::queue::{PacingQueue, Priority, SubmitContext};
use crate::progress::ProgressRuntime;
use crate::provider::{GeneratedArtifact, GenerationRequest, GenerationService, PanelFormatter};
use crate::types::{ArtifactRef, PanelRole, RunId, Seed};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Result of one job, successful or exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelResult {
    pub job_id: String,
    pub role: PanelRole,
    pub artifact_ref: Option<ArtifactRef>,
    pub seed: Seed,
    pub status: PanelStatus,
    pub retry_count: usize,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl PanelResult {
    pub fn succeeded(job: &GenerationJob, artifact: GeneratedArtifact, attempts: usize) -> Self {
        let mut meta = BTreeMap::new();
        if artifact.seed_used != job.seed {
            meta.insert("requested_seed".to_string(), job.seed.to_string());
        }
        Self {
            job_id: job.id.clone(),
            role: job.role.clone(),
            artifact_ref: Some(artifact.artifact_ref),
            seed: artifact.seed_used,
            status: PanelStatus::Succeeded,
            retry_count: attempts.saturating_sub(1),
            meta,
        }
    }

    pub fn failed(job: &GenerationJob, attempts: usize, message: impl Into<String>) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("error".to_string(), message.into());
        Self {
            job_id: job.id.clone(),
            role: job.role.clone(),
            artifact_ref: None,
            seed: job.seed,
            status: PanelStatus::Failed,
            retry_count: attempts.saturating_sub(1),
            meta,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == PanelStatus::Succeeded && self.artifact_ref.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.meta.get("error").map(String::as_str)
    }
}

/// Retry policy for generation attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Total attempts per job, including the first
    pub max_attempts: usize,
    /// Delay after the first failed attempt (milliseconds); doubles per attempt
    pub base_backoff_ms: u64,
    /// Upper bound for the computed delay (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 3_000,
            max_backoff_ms: 48_000,
        }
    }
}

impl ExecutorConfig {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let millis = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms))
    }

    /// Delay before retrying after failed attempt `attempt`; a server hint
    /// replaces the computed backoff but never exceeds `max_backoff_ms`.
    pub fn retry_delay(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(Duration::from_millis(self.max_backoff_ms)),
            None => self.backoff_for(attempt),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("executor.max_attempts must be at least 1".to_string());
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(format!(
                "executor.max_backoff_ms ({}) is below executor.base_backoff_ms ({})",
                self.max_backoff_ms, self.base_backoff_ms
            ));
        }
        Ok(())
    }
}

/// Seam between the executor and whatever serialises generation calls.
#[async_trait]
pub trait GenerationSubmitter: Send + Sync {
    async fn submit_generation(
        &self,
        request: GenerationRequest,
        context: SubmitContext,
    ) -> Result<GeneratedArtifact, PipelineError>;
}

/// The production submitter: generation service calls paced by a shared queue.
#[derive(Clone)]
pub struct QueuedGeneration {
    queue: Arc<PacingQueue<GeneratedArtifact>>,
    service: Arc<dyn GenerationService>,
}

impl QueuedGeneration {
    pub fn new(queue: Arc<PacingQueue<GeneratedArtifact>>, service: Arc<dyn GenerationService>) -> Self {
        Self { queue, service }
    }

    pub fn queue(&self) -> &Arc<PacingQueue<GeneratedArtifact>> {
        &self.queue
    }
}

#[async_trait]
impl GenerationSubmitter for QueuedGeneration {
    async fn submit_generation(
        &self,
        request: GenerationRequest,
        context: SubmitContext,
    ) -> Result<GeneratedArtifact, PipelineError> {
        let service = Arc::clone(&self.service);
        self.queue
            .submit(context, move || {
                let service = Arc::clone(&service);
                let request = request.clone();
                async move {
                    info!(
                        service = service.service_name(),
                        role = %request.role,
                        seed = request.seed,
                        "Generation request sent"
                    );
                    let result = service.generate(request).await;
                    if let Ok(artifact) = &result {
                        info!(artifact = %artifact.artifact_ref, "Generation response received");
                    }
                    result
                }
            })
            .await
    }
}

/// Per-run context for executor calls.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub priority: Priority,
}

impl ExecutionContext {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(&self, priority: Priority) -> Self {
        Self {
            run_id: self.run_id.clone(),
            priority,
        }
    }
}

enum AttemptFailure {
    Retryable(ServiceError),
    Terminal(ServiceError),
    Abort(PipelineError),
}

fn classify(err: PipelineError) -> AttemptFailure {
    match err {
        PipelineError::Service(service) => match service {
            // Throttles that outlived the queue's own budget count as one transient attempt
            ServiceError::RateLimited { .. } | ServiceError::Transient { .. } => {
                AttemptFailure::Retryable(service)
            }
            ServiceError::Terminal { .. } => AttemptFailure::Terminal(service),
        },
        other => AttemptFailure::Abort(other),
    }
}

/// Executes single jobs, applying the retry policy.
pub struct GenerationExecutor {
    config: ExecutorConfig,
    formatter: Option<Arc<dyn PanelFormatter>>,
    progress: Option<Arc<ProgressRuntime>>,
}

impl GenerationExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            formatter: None,
            progress: None,
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PanelFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<ProgressRuntime>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `job` to completion.
    ///
    /// Anchor exhaustion returns `AnchorFailure`; a dependent job that exhausts its
    /// attempts yields a `Failed` result. Cancellation and queue shutdown propagate.
    pub async fn execute<S: GenerationSubmitter>(
        &self,
        submitter: &S,
        job: &GenerationJob,
        design: &DesignSpecification,
        context: &ExecutionContext,
    ) -> Result<PanelResult, PipelineError> {
        let session = context.run_id.to_string();
        self.emit_event(
            &session,
            "panel_generation_started",
            json!({
                "role": job.role,
                "job_id": job.id,
                "seed": job.seed,
                "bypass": job.bypass,
            }),
        );

        let outcome = if job.bypass {
            self.render_bypass(job, design).await
        } else {
            let request = job.to_request();
            let submit_context = SubmitContext::new(job.id.clone())
                .for_run(&context.run_id)
                .with_priority(context.priority);
            self.with_retries(&job.role, || {
                submitter.submit_generation(request.clone(), submit_context.clone())
            })
            .await
        };

        match outcome {
            Ok((artifact, attempts)) => {
                let result = PanelResult::succeeded(job, artifact, attempts);
                self.emit_event(
                    &session,
                    "panel_generation_completed",
                    json!({
                        "role": job.role,
                        "artifact_ref": result.artifact_ref,
                        "attempts": attempts,
                    }),
                );
                Ok(result)
            }
            Err((AttemptFailure::Abort(err), _)) => Err(err),
            Err((AttemptFailure::Retryable(err), attempts))
            | Err((AttemptFailure::Terminal(err), attempts)) => {
                warn!(
                    role = %job.role,
                    attempts,
                    error = %err,
                    "Generation job failed"
                );
                self.emit_event(
                    &session,
                    "panel_generation_failed",
                    json!({
                        "role": job.role,
                        "attempts": attempts,
                        "error": err.to_string(),
                    }),
                );
                if job.role.is_anchor() {
                    return Err(PipelineError::AnchorFailure {
                        role: job.role.clone(),
                        attempts,
                        message: err.to_string(),
                    });
                }
                Ok(PanelResult::failed(job, attempts, err.to_string()))
            }
        }
    }

    async fn render_bypass(
        &self,
        job: &GenerationJob,
        design: &DesignSpecification,
    ) -> Result<(GeneratedArtifact, usize), (AttemptFailure, usize)> {
        let Some(formatter) = &self.formatter else {
            return Err((
                AttemptFailure::Terminal(ServiceError::terminal(format!(
                    "no panel formatter configured for data role {}",
                    job.role
                ))),
                0,
            ));
        };
        let seed = job.seed;
        self.with_retries(&job.role, || async move {
            formatter
                .render(&job.role, design)
                .await
                .map(|artifact_ref| GeneratedArtifact {
                    artifact_ref,
                    seed_used: seed,
                })
                .map_err(PipelineError::Service)
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        role: &PanelRole,
        mut attempt_fn: F,
    ) -> Result<(T, usize), (AttemptFailure, usize)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match attempt_fn().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => err,
            };
            match classify(err) {
                AttemptFailure::Retryable(service) if attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt, service.retry_after());
                    warn!(
                        role = %role,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %service,
                        "Retrying generation after transient failure"
                    );
                    sleep(delay).await;
                }
                failure => return Err((failure, attempt)),
            }
        }
    }

    fn emit_event(&self, session_id: &str, event_type: &str, data: serde_json::Value) {
        if let Some(progress) = &self.progress {
            progress.emit_event_best_effort(session_id, event_type, data);
        }
    }
}
