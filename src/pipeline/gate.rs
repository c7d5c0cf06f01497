//! Consistency gate: scores dependent panels against the design fingerprint and
//! regenerates drifting panels with progressively stricter parameters.
//!
//! After evaluation round `r` (1-based) with failures:
//! - `r < max_retries`: regenerate failures at strictness level `r`;
//! - `r == max_retries`: regenerate failures with the strict fallback set;
//! - `r > max_retries`: abort, naming the non-conforming roles.
//!
//! The gate therefore runs at most `max_retries + 1` evaluation rounds.

use crate::error::PipelineError;
use crate::pipeline::executor::PanelResult;
use crate::pipeline::plan::GenerationJob;
use crate::progress::ProgressRuntime;
use crate::provider::{DesignFingerprint, PromptComposer, PromptPair, SimilarityService};
use crate::seed::bump_seed;
use crate::types::PanelRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Parameters of the final, most constrained retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrictFallback {
    pub reference_strength: f32,
    /// Appended to the job's negative prompt.
    pub negative_prompt: String,
    pub seed_offset: u64,
}

impl Default for StrictFallback {
    fn default() -> Self {
        Self {
            reference_strength: 0.9,
            negative_prompt:
                "different building, altered massing, altered roof, extra storeys, different materials"
                    .to_string(),
            seed_offset: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub max_retries: u32,
    pub pass_threshold: f32,
    /// Reference strength used by dependent jobs before any retry.
    pub base_reference_strength: f32,
    /// Added to the reference strength per strictness level.
    pub strictness_step: f32,
    pub max_reference_strength: f32,
    pub fallback: StrictFallback,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            pass_threshold: 0.8,
            base_reference_strength: 0.55,
            strictness_step: 0.15,
            max_reference_strength: 0.85,
            fallback: StrictFallback::default(),
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, value: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(format!("gate.{} must be within [0, 1], got {}", name, value))
            }
        };
        unit("pass_threshold", self.pass_threshold)?;
        unit("base_reference_strength", self.base_reference_strength)?;
        unit("max_reference_strength", self.max_reference_strength)?;
        unit("fallback.reference_strength", self.fallback.reference_strength)?;
        if self.strictness_step < 0.0 {
            return Err(format!(
                "gate.strictness_step must not be negative, got {}",
                self.strictness_step
            ));
        }
        Ok(())
    }

    fn strictness_reference(&self, level: u32) -> f32 {
        (self.base_reference_strength + self.strictness_step * level as f32)
            .min(self.max_reference_strength)
    }
}

/// Gate states, recorded in the order they were entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Composing,
    GateEvaluating { round: u32 },
    RetryFailed { round: u32 },
    StrictFallback { round: u32 },
    Regenerating { round: u32 },
    Passed,
    Aborted,
}

/// One score of one panel in one evaluation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyRecord {
    pub role: PanelRole,
    pub match_score: f32,
    pub passed: bool,
    pub attempt: u32,
}

/// A dependent panel entering the gate: the job that produced it and its result.
#[derive(Debug, Clone)]
pub struct GateCandidate {
    pub job: GenerationJob,
    pub result: PanelResult,
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub passed: bool,
    pub rounds: u32,
    pub records: Vec<ConsistencyRecord>,
    pub transitions: Vec<GateState>,
    /// Candidates after regeneration, in input order.
    pub candidates: Vec<GateCandidate>,
    /// Roles still below threshold with their latest score; empty when passed.
    pub failed: Vec<(PanelRole, f32)>,
}

impl GateOutcome {
    /// Outcome when fingerprinting is disabled: passed with no records.
    pub fn skipped(candidates: Vec<GateCandidate>) -> Self {
        Self {
            passed: true,
            rounds: 0,
            records: Vec::new(),
            transitions: vec![GateState::Composing, GateState::Passed],
            candidates,
            failed: Vec::new(),
        }
    }

    /// Latest score per role.
    pub fn final_scores(&self) -> BTreeMap<PanelRole, f32> {
        self.records
            .iter()
            .map(|record| (record.role.clone(), record.match_score))
            .collect()
    }

    pub fn into_error(self) -> Option<PipelineError> {
        (!self.passed).then_some(PipelineError::ConsistencyFailure {
            failed: self.failed,
        })
    }
}

/// Regeneration seam: the run wires this to the generation executor.
#[async_trait]
pub trait PanelRegenerator: Send + Sync {
    async fn regenerate(&self, job: &GenerationJob) -> Result<PanelResult, PipelineError>;
}

pub struct ConsistencyGate {
    config: GateConfig,
    similarity: Arc<dyn SimilarityService>,
    composer: Arc<dyn PromptComposer>,
    progress: Option<Arc<ProgressRuntime>>,
}

impl ConsistencyGate {
    pub fn new(
        config: GateConfig,
        similarity: Arc<dyn SimilarityService>,
        composer: Arc<dyn PromptComposer>,
    ) -> Self {
        Self {
            config,
            similarity,
            composer,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<Arc<ProgressRuntime>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Job for strictness `level` (1-based), derived from the original job.
    pub fn strict_job(
        &self,
        original: &GenerationJob,
        fingerprint: &DesignFingerprint,
        level: u32,
    ) -> GenerationJob {
        let pair = self.composer.tighten(&Self::prompt_of(original), fingerprint, level);
        GenerationJob {
            prompt: pair.prompt,
            negative_prompt: pair.negative_prompt,
            seed: bump_seed(original.seed, u64::from(level.saturating_sub(1))),
            style_reference: Some(fingerprint.source_artifact_ref.clone()),
            reference_strength: Some(self.config.strictness_reference(level)),
            ..original.clone()
        }
    }

    /// Job for the final retry, using the strict fallback parameter set.
    pub fn fallback_job(&self, original: &GenerationJob, fingerprint: &DesignFingerprint) -> GenerationJob {
        let fallback = &self.config.fallback;
        let level = self.config.max_retries.max(1);
        let pair = self.composer.tighten(&Self::prompt_of(original), fingerprint, level);
        GenerationJob {
            prompt: pair.prompt,
            negative_prompt: format!("{}, {}", pair.negative_prompt, fallback.negative_prompt),
            seed: bump_seed(original.seed, fallback.seed_offset),
            style_reference: Some(fingerprint.source_artifact_ref.clone()),
            reference_strength: Some(fallback.reference_strength),
            ..original.clone()
        }
    }

    fn prompt_of(job: &GenerationJob) -> PromptPair {
        PromptPair {
            prompt: job.prompt.clone(),
            negative_prompt: job.negative_prompt.clone(),
        }
    }

    /// Run the gate over `candidates`. Only cancellation or queue shutdown
    /// surfaces as an error; an aborted gate is reported in the outcome.
    pub async fn run<R: PanelRegenerator>(
        &self,
        session_id: &str,
        fingerprint: &DesignFingerprint,
        candidates: Vec<GateCandidate>,
        regenerator: &R,
    ) -> Result<GateOutcome, PipelineError> {
        let originals: Vec<GenerationJob> = candidates.iter().map(|c| c.job.clone()).collect();
        let mut candidates = candidates;
        let mut records = Vec::new();
        let mut transitions = vec![GateState::Composing];
        let mut pending: Vec<usize> = (0..candidates.len()).collect();
        let mut round = 0u32;

        loop {
            round += 1;
            transitions.push(GateState::GateEvaluating { round });
            self.emit_event(
                session_id,
                "gate_round_started",
                json!({ "round": round, "panels": pending.len() }),
            );

            let mut failed = Vec::new();
            for &idx in &pending {
                let record = self.score(&candidates[idx], fingerprint, round).await;
                if !record.passed {
                    failed.push((idx, record.match_score));
                }
                records.push(record);
            }

            info!(
                round,
                evaluated = pending.len(),
                failed = failed.len(),
                "Consistency gate round completed"
            );
            self.emit_event(
                session_id,
                "gate_round_completed",
                json!({
                    "round": round,
                    "evaluated": pending.len(),
                    "failed": failed
                        .iter()
                        .map(|(idx, score)| json!({"role": candidates[*idx].job.role, "score": score}))
                        .collect::<Vec<_>>(),
                }),
            );

            if failed.is_empty() {
                transitions.push(GateState::Passed);
                self.emit_event(session_id, "gate_passed", json!({ "rounds": round }));
                return Ok(GateOutcome {
                    passed: true,
                    rounds: round,
                    records,
                    transitions,
                    candidates,
                    failed: Vec::new(),
                });
            }

            if round > self.config.max_retries {
                let failed: Vec<(PanelRole, f32)> = failed
                    .into_iter()
                    .map(|(idx, score)| (candidates[idx].job.role.clone(), score))
                    .collect();
                warn!(
                    rounds = round,
                    failed = ?failed,
                    "Consistency gate aborted"
                );
                transitions.push(GateState::Aborted);
                self.emit_event(
                    session_id,
                    "gate_aborted",
                    json!({
                        "rounds": round,
                        "failed_roles": failed.iter().map(|(role, _)| role).collect::<Vec<_>>(),
                    }),
                );
                return Ok(GateOutcome {
                    passed: false,
                    rounds: round,
                    records,
                    transitions,
                    candidates,
                    failed,
                });
            }

            let use_fallback = round == self.config.max_retries;
            transitions.push(if use_fallback {
                GateState::StrictFallback { round }
            } else {
                GateState::RetryFailed { round }
            });
            transitions.push(GateState::Regenerating { round });

            for &(idx, score) in &failed {
                let original = &originals[idx];
                let job = if use_fallback {
                    self.fallback_job(original, fingerprint)
                } else {
                    self.strict_job(original, fingerprint, round)
                };
                self.emit_event(
                    session_id,
                    "panel_regenerating",
                    json!({
                        "role": job.role,
                        "round": round,
                        "previous_score": score,
                        "strict_fallback": use_fallback,
                        "seed": job.seed,
                        "reference_strength": job.reference_strength,
                    }),
                );

                match regenerator.regenerate(&job).await {
                    Ok(result) if result.is_succeeded() => {
                        candidates[idx] = GateCandidate { job, result };
                    }
                    Ok(result) => {
                        warn!(
                            role = %job.role,
                            error = result.error_message().unwrap_or("unknown"),
                            "Regeneration failed; keeping prior artifact"
                        );
                    }
                    Err(err @ (PipelineError::Cancelled(_) | PipelineError::QueueStopped)) => {
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(role = %job.role, error = %err, "Regeneration failed; keeping prior artifact");
                    }
                }
            }

            pending = failed.into_iter().map(|(idx, _)| idx).collect();
        }
    }

    async fn score(
        &self,
        candidate: &GateCandidate,
        fingerprint: &DesignFingerprint,
        round: u32,
    ) -> ConsistencyRecord {
        let role = candidate.job.role.clone();
        let match_score = match &candidate.result.artifact_ref {
            Some(artifact) => match self.similarity.score(artifact, fingerprint).await {
                Ok(score) => score.score.clamp(0.0, 1.0),
                Err(err) => {
                    warn!(role = %role, error = %err, "Similarity scoring failed; counting as 0");
                    0.0
                }
            },
            None => 0.0,
        };
        ConsistencyRecord {
            passed: match_score >= self.config.pass_threshold,
            role,
            match_score,
            attempt: round,
        }
    }

    fn emit_event(&self, session_id: &str, event_type: &str, data: serde_json::Value) {
        if let Some(progress) = &self.progress {
            progress.emit_event_best_effort(session_id, event_type, data);
        }
    }
}
