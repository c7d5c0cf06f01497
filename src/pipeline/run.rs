//! Single run entry point: plan, anchor, fingerprint, dependents, gate, drift,
//! composition, persistence.
//! Callers use [`Pipeline::run`] only; orchestration does not leak into adapters.

use crate::design::DesignSpecification;
use crate::error::PipelineError;
use crate::pipeline::drift::{self, DriftConfig, DriftReport};
use crate::pipeline::executor::{
    ExecutionContext, ExecutorConfig, GenerationExecutor, PanelResult, QueuedGeneration,
};
use crate::pipeline::gate::{
    ConsistencyGate, ConsistencyRecord, GateCandidate, GateConfig, GateOutcome, PanelRegenerator,
};
use crate::pipeline::plan::{GenerationJob, GenerationPlan, JobPlanner, PlanOptions};
use crate::pipeline::queue::{PacingQueue, Priority};
use crate::progress::ProgressRuntime;
use crate::provider::{
    CompositionPanel, CompositionRequest, CompositionService, DefaultPromptComposer,
    DesignFingerprint, FingerprintService, GeneratedArtifact, GenerationService, PanelFormatter,
    PanelValidator, PromptComposer, SimilarityService, ValidatorResult,
};
use crate::seed::SeedPlan;
use crate::store::{BaselineStore, ConsistencyMetadata, RunBundle, RunMetadata, RunStatistics};
use crate::types::{ArtifactRef, PanelRole, RunId, Seed};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Retry, gate and drift parameters of a pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSettings {
    pub executor: ExecutorConfig,
    pub gate: GateConfig,
    pub drift: DriftConfig,
}

/// External collaborators injected into a pipeline.
#[derive(Clone)]
pub struct PipelineServices {
    pub generation: Arc<dyn GenerationService>,
    pub similarity: Arc<dyn SimilarityService>,
    pub fingerprint: Arc<dyn FingerprintService>,
    pub composition: Arc<dyn CompositionService>,
    pub formatter: Option<Arc<dyn PanelFormatter>>,
    pub validators: Vec<Arc<dyn PanelValidator>>,
    pub composer: Arc<dyn PromptComposer>,
}

impl PipelineServices {
    pub fn new(
        generation: Arc<dyn GenerationService>,
        similarity: Arc<dyn SimilarityService>,
        fingerprint: Arc<dyn FingerprintService>,
        composition: Arc<dyn CompositionService>,
    ) -> Self {
        Self {
            generation,
            similarity,
            fingerprint,
            composition,
            formatter: None,
            validators: Vec::new(),
            composer: Arc::new(DefaultPromptComposer),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PanelFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn PanelValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn PromptComposer>) -> Self {
        self.composer = composer;
        self
    }
}

/// Per-run inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub roles: Option<Vec<PanelRole>>,
    pub explicit_seed: Option<Seed>,
    pub width: u32,
    pub height: u32,
    pub site_constraints: Option<String>,
    pub fingerprint_enabled: bool,
    /// Overlay artifact passed through to composition.
    pub overlay: Option<ArtifactRef>,
    /// Generated when absent.
    pub run_id: Option<RunId>,
    /// Return the design's latest baseline instead of generating when it was
    /// produced from the same design and plan.
    pub reuse_baseline: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        let plan = PlanOptions::default();
        Self {
            roles: None,
            explicit_seed: None,
            width: plan.width,
            height: plan.height,
            site_constraints: None,
            fingerprint_enabled: true,
            overlay: None,
            run_id: None,
            reuse_baseline: false,
        }
    }
}

#[derive(Debug)]
pub struct RunSuccess {
    pub run_id: RunId,
    pub panels: Vec<PanelResult>,
    pub fingerprint: Option<Arc<DesignFingerprint>>,
    pub consistency_report: DriftReport,
    pub bundle: RunBundle,
    /// Set when the bundle could not be persisted; the run still succeeded.
    pub persistence_warning: Option<String>,
    /// The bundle is an earlier baseline returned without generating.
    pub reused_baseline: bool,
}

#[derive(Debug)]
pub struct RunFailure {
    pub run_id: RunId,
    pub error: PipelineError,
    pub failed_roles: Vec<PanelRole>,
    /// Latest consistency score per scored role.
    pub scores: BTreeMap<PanelRole, f32>,
    /// Every panel result produced before the failure.
    pub panels: Vec<PanelResult>,
    /// Successful panels outside the failed roles. Never persisted.
    pub partial_bundle: Option<RunBundle>,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Succeeded(RunSuccess),
    Failed(RunFailure),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Succeeded(_))
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            PipelineOutcome::Succeeded(success) => &success.run_id,
            PipelineOutcome::Failed(failure) => &failure.run_id,
        }
    }

    pub fn into_result(self) -> Result<RunSuccess, RunFailure> {
        match self {
            PipelineOutcome::Succeeded(success) => Ok(success),
            PipelineOutcome::Failed(failure) => Err(failure),
        }
    }
}

/// Gate regenerations go through the same executor and queue as first attempts.
struct RunRegenerator<'a> {
    executor: &'a GenerationExecutor,
    submitter: &'a QueuedGeneration,
    design: &'a DesignSpecification,
    context: ExecutionContext,
}

#[async_trait]
impl PanelRegenerator for RunRegenerator<'_> {
    async fn regenerate(&self, job: &GenerationJob) -> Result<PanelResult, PipelineError> {
        self.executor
            .execute(self.submitter, job, self.design, &self.context)
            .await
    }
}

/// Partial state carried into a failure report.
#[derive(Default)]
struct RunProgress {
    required_roles: Vec<PanelRole>,
    panels: Vec<PanelResult>,
    fingerprint: Option<Arc<DesignFingerprint>>,
    records: Vec<ConsistencyRecord>,
}

/// Multi-panel generation pipeline. Cheap to share; several pipelines may share
/// one pacing queue.
pub struct Pipeline {
    settings: PipelineSettings,
    services: PipelineServices,
    queue: Arc<PacingQueue<GeneratedArtifact>>,
    store: Option<Arc<dyn BaselineStore>>,
    progress: Option<Arc<ProgressRuntime>>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        services: PipelineServices,
        queue: Arc<PacingQueue<GeneratedArtifact>>,
    ) -> Self {
        Self {
            settings,
            services,
            queue,
            store: None,
            progress: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressRuntime>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<PacingQueue<GeneratedArtifact>> {
        &self.queue
    }

    /// Abort a run in flight: its queued units are dropped and later submissions rejected.
    pub async fn cancel(&self, run_id: &RunId) -> usize {
        self.queue.cancel_run(run_id).await
    }

    pub fn planner(&self) -> JobPlanner {
        JobPlanner::new(Arc::clone(&self.services.composer))
    }

    pub fn plan_options(&self, options: &RunOptions) -> PlanOptions {
        PlanOptions {
            roles: options.roles.clone(),
            explicit_seed: options.explicit_seed,
            width: options.width,
            height: options.height,
            site_constraints: options.site_constraints.clone(),
            fingerprint_enabled: options.fingerprint_enabled,
            reference_strength: self.settings.gate.base_reference_strength,
        }
    }

    /// Run the whole pipeline for `design`.
    pub async fn run(&self, design: &DesignSpecification, options: RunOptions) -> PipelineOutcome {
        let started = Instant::now();
        let run_id = options.run_id.clone().unwrap_or_else(RunId::generate);
        let session = run_id.to_string();
        info!(run_id = %run_id, design_id = %design.design_id, "Pipeline run started");
        self.emit_event(
            &session,
            "run_started",
            json!({
                "design_id": design.design_id,
                "fingerprint_enabled": options.fingerprint_enabled,
            }),
        );

        let mut state = RunProgress::default();
        let result = self.run_inner(design, &options, &run_id, &mut state, started).await;
        self.queue.release_run(&run_id);

        match result {
            Ok(success) => {
                info!(
                    run_id = %run_id,
                    panels = success.panels.len(),
                    overall_score = success.consistency_report.overall_score,
                    "Pipeline run completed"
                );
                self.emit_event(
                    &session,
                    "run_completed",
                    json!({
                        "panels": success.panels.len(),
                        "overall_score": success.consistency_report.overall_score,
                        "persisted": success.persistence_warning.is_none() && self.store.is_some(),
                    }),
                );
                PipelineOutcome::Succeeded(success)
            }
            Err(err) => self.failure(design, &options, run_id, err, state, started),
        }
    }

    async fn run_inner(
        &self,
        design: &DesignSpecification,
        options: &RunOptions,
        run_id: &RunId,
        state: &mut RunProgress,
        started: Instant,
    ) -> Result<RunSuccess, PipelineError> {
        let session = run_id.to_string();
        if !self.queue.is_running() {
            return Err(PipelineError::QueueStopped);
        }

        // Phase one: ordering, seeds, anchor job
        let planner = self.planner();
        let plan = planner.plan(design, self.plan_options(options))?;
        self.emit_event(
            &session,
            "plan_constructed",
            json!({
                "roles": plan.roles,
                "base_seed": plan.seeds.base_seed(),
                "explicit_seed": plan.seeds.is_explicit(),
            }),
        );
        for correction in &plan.corrections {
            self.emit_event(&session, "plan_corrected", json!(correction));
        }
        state.required_roles = plan.roles.clone();
        let plan_hash = self.plan_hash(&plan, options);

        if options.reuse_baseline {
            if let Some((bundle, report)) = self.reusable_baseline(design, &plan_hash)? {
                info!(
                    run_id = %run_id,
                    baseline_run_id = %bundle.run_id,
                    "Inputs unchanged; reusing latest baseline"
                );
                self.emit_event(
                    &session,
                    "baseline_reused",
                    json!({ "baseline_run_id": bundle.run_id }),
                );
                return Ok(RunSuccess {
                    run_id: run_id.clone(),
                    panels: bundle.panels.clone(),
                    fingerprint: bundle.fingerprint.clone().map(Arc::new),
                    consistency_report: report,
                    bundle,
                    persistence_warning: None,
                    reused_baseline: true,
                });
            }
        }

        let submitter = QueuedGeneration::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.services.generation),
        );
        let mut executor = GenerationExecutor::new(self.settings.executor.clone())
            .with_progress(self.progress.clone());
        if let Some(formatter) = &self.services.formatter {
            executor = executor.with_formatter(Arc::clone(formatter));
        }
        let context = ExecutionContext::new(run_id.clone());

        // Anchor: fully resolved before anything else is submitted
        let anchor = executor
            .execute(
                &submitter,
                &plan.anchor,
                design,
                &context.with_priority(Priority::Urgent),
            )
            .await?;
        let anchor_ref = anchor
            .artifact_ref
            .clone()
            .ok_or_else(|| PipelineError::AnchorFailure {
                role: anchor.role.clone(),
                attempts: anchor.retry_count + 1,
                message: "anchor produced no artifact".to_string(),
            })?;
        state.panels.push(anchor.clone());

        if options.fingerprint_enabled {
            let fingerprint = self
                .services
                .fingerprint
                .extract(&anchor_ref, design)
                .await
                .map_err(|e| PipelineError::FingerprintFailed(e.to_string()))?;
            info!(
                run_id = %run_id,
                massing = %fingerprint.massing_descriptor,
                "Design fingerprint extracted"
            );
            self.emit_event(
                &session,
                "fingerprint_extracted",
                json!({
                    "source_artifact_ref": fingerprint.source_artifact_ref,
                    "massing": fingerprint.massing_descriptor,
                    "roof": fingerprint.roof_descriptor,
                }),
            );
            state.fingerprint = Some(Arc::new(fingerprint));
        }

        // Phase two: dependents built from the fingerprint
        let jobs = planner.build_dependents(&plan, design, state.fingerprint.as_deref());
        let results = self
            .generate_dependents(&executor, &submitter, design, &context, &jobs)
            .await?;
        state.panels.extend(results.iter().map(|(_, result)| result.clone()));

        let failed: Vec<&PanelResult> = results
            .iter()
            .map(|(_, result)| result)
            .filter(|result| !result.is_succeeded())
            .collect();
        if let Some(first) = failed.first() {
            return Err(PipelineError::GenerationFailed {
                role: first.role.clone(),
                attempts: first.retry_count + 1,
                message: first.error_message().unwrap_or("generation failed").to_string(),
            });
        }

        let (bypassed, candidates): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|(job, _)| job.bypass);
        let candidates: Vec<GateCandidate> = candidates
            .into_iter()
            .map(|(job, result)| GateCandidate { job, result })
            .collect();
        let candidate_count = candidates.len();

        let gate_outcome = match &state.fingerprint {
            Some(fingerprint) => {
                let gate = ConsistencyGate::new(
                    self.settings.gate.clone(),
                    Arc::clone(&self.services.similarity),
                    Arc::clone(&self.services.composer),
                )
                .with_progress(self.progress.clone());
                let regenerator = RunRegenerator {
                    executor: &executor,
                    submitter: &submitter,
                    design,
                    context: context.with_priority(Priority::High),
                };
                gate.run(&session, fingerprint, candidates, &regenerator).await?
            }
            None => GateOutcome::skipped(candidates),
        };
        state.records = gate_outcome.records.clone();

        // Replace first attempts with the gate's final artifacts
        let mut final_panels: HashMap<PanelRole, PanelResult> = HashMap::new();
        final_panels.insert(anchor.role.clone(), anchor);
        for (_, result) in bypassed {
            final_panels.insert(result.role.clone(), result);
        }
        for candidate in &gate_outcome.candidates {
            final_panels.insert(candidate.result.role.clone(), candidate.result.clone());
        }
        let mut panels: Vec<PanelResult> = Vec::with_capacity(plan.roles.len());
        for role in &plan.roles {
            let panel = final_panels
                .remove(role)
                .ok_or_else(|| PipelineError::GenerationFailed {
                    role: role.clone(),
                    attempts: 0,
                    message: "no panel result for planned role".to_string(),
                })?;
            panels.push(panel);
        }
        state.panels = panels.clone();

        if !gate_outcome.passed {
            let dropped = self.queue.cancel_run(run_id).await;
            if dropped > 0 {
                warn!(run_id = %run_id, dropped, "Dropped queued units of aborted run");
            }
            return Err(gate_outcome
                .into_error()
                .unwrap_or(PipelineError::ConsistencyFailure { failed: Vec::new() }));
        }

        let validator_results = self.run_validators(&panels, design).await;
        let report = drift::aggregate(
            &plan.roles,
            &gate_outcome.records,
            self.settings.gate.pass_threshold,
            &validator_results,
            &self.settings.drift,
        );
        if !report.passed {
            warn!(
                run_id = %run_id,
                overall_score = report.overall_score,
                failed_roles = ?report.summary.failed_roles,
                "Drift report below expectations"
            );
        }

        let scores = gate_outcome.final_scores();
        let request = CompositionRequest {
            panels: panels
                .iter()
                .filter_map(|panel| {
                    let artifact_ref = panel.artifact_ref.clone()?;
                    let mut meta = BTreeMap::new();
                    meta.insert("seed".to_string(), panel.seed.to_string());
                    if let Some(score) = scores.get(&panel.role) {
                        meta.insert("consistency_score".to_string(), format!("{:.3}", score));
                    }
                    Some(CompositionPanel {
                        role: panel.role.clone(),
                        artifact_ref,
                        meta,
                    })
                })
                .collect(),
            overlay: options.overlay.clone(),
        };
        let composition = self
            .services
            .composition
            .compose(request)
            .await
            .map_err(|e| PipelineError::Composition(e.to_string()))?;
        self.emit_event(
            &session,
            "composition_completed",
            json!({
                "composed_artifact_ref": composition.composed_artifact_ref,
                "width": composition.dimensions.width,
                "height": composition.dimensions.height,
            }),
        );

        let statistics = RunStatistics {
            total_jobs: plan.roles.len(),
            generated: panels.iter().filter(|p| !p.role.is_data_role()).count(),
            bypassed: panels.iter().filter(|p| p.role.is_data_role()).count(),
            regenerations: gate_outcome.records.len().saturating_sub(candidate_count),
            gate_rounds: gate_outcome.rounds,
            generation_attempts: panels.iter().map(|p| p.retry_count + 1).sum(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let mut bundle = build_bundle(
            design,
            run_id,
            &plan.seeds,
            &plan.roles,
            panels.clone(),
            state.fingerprint.as_deref().cloned(),
            options.fingerprint_enabled,
            statistics,
        )?;
        bundle.composition = Some(composition);
        bundle.metadata.plan_hash = plan_hash;
        bundle.consistency = ConsistencyMetadata {
            gate_passed: true,
            rounds: gate_outcome.rounds,
            records: gate_outcome.records,
            drift: Some(report.clone()),
        };

        let persistence_warning = self.persist(&session, &bundle);

        Ok(RunSuccess {
            run_id: run_id.clone(),
            panels,
            fingerprint: state.fingerprint.clone(),
            consistency_report: report,
            bundle,
            persistence_warning,
            reused_baseline: false,
        })
    }

    /// Digest of everything besides the design that decides a run's panels.
    fn plan_hash(&self, plan: &GenerationPlan, options: &RunOptions) -> String {
        let inputs = json!({
            "roles": plan.roles,
            "base_seed": plan.seeds.base_seed(),
            "explicit_seed": plan.seeds.is_explicit(),
            "width": options.width,
            "height": options.height,
            "site_constraints": options.site_constraints,
            "overlay": options.overlay,
            "fingerprint_enabled": options.fingerprint_enabled,
            "gate": self.settings.gate,
            "drift": self.settings.drift,
        });
        blake3::hash(inputs.to_string().as_bytes()).to_hex().to_string()
    }

    /// The design's latest baseline when it came from identical inputs.
    /// Lookup failures fall back to generating.
    fn reusable_baseline(
        &self,
        design: &DesignSpecification,
        plan_hash: &str,
    ) -> Result<Option<(RunBundle, DriftReport)>, PipelineError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let latest = match store.load_latest(&design.design_id) {
            Ok(latest) => latest,
            Err(err) => {
                warn!(
                    design_id = %design.design_id,
                    error = %err,
                    "Baseline lookup failed; generating"
                );
                return Ok(None);
            }
        };
        let Some(bundle) = latest else {
            return Ok(None);
        };
        let design_hash = design.content_hash()?;
        let reusable = bundle.metadata.design_hash == design_hash
            && bundle.metadata.plan_hash == plan_hash
            && bundle.validate().is_ok();
        if !reusable {
            debug!(
                design_id = %design.design_id,
                baseline_run_id = %bundle.run_id,
                "Latest baseline is stale; generating"
            );
            return Ok(None);
        }
        Ok(bundle
            .consistency
            .drift
            .clone()
            .map(|report| (bundle, report)))
    }

    /// Submit every dependent job; the queue serialises the calls in priority order.
    async fn generate_dependents(
        &self,
        executor: &GenerationExecutor,
        submitter: &QueuedGeneration,
        design: &DesignSpecification,
        context: &ExecutionContext,
        jobs: &[GenerationJob],
    ) -> Result<Vec<(GenerationJob, PanelResult)>, PipelineError> {
        let mut futures = FuturesUnordered::new();
        for (index, job) in jobs.iter().enumerate() {
            futures.push(async move {
                let result = executor.execute(submitter, job, design, context).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<PanelResult>> = vec![None; jobs.len()];
        while let Some((index, result)) = futures.next().await {
            match result {
                Ok(panel) => results[index] = Some(panel),
                Err(err) => {
                    // Queued siblings are discarded along with the unpolled futures
                    self.queue.cancel_run(&context.run_id).await;
                    return Err(err);
                }
            }
        }

        Ok(jobs
            .iter()
            .cloned()
            .zip(results)
            .filter_map(|(job, result)| result.map(|result| (job, result)))
            .collect())
    }

    async fn run_validators(
        &self,
        panels: &[PanelResult],
        design: &DesignSpecification,
    ) -> Vec<ValidatorResult> {
        let mut results = Vec::new();
        for validator in &self.services.validators {
            for panel in panels {
                let Some(artifact) = &panel.artifact_ref else {
                    continue;
                };
                match validator.validate(&panel.role, artifact, design).await {
                    Ok(checks) => results.extend(checks),
                    Err(err) => warn!(role = %panel.role, error = %err, "Panel validator failed"),
                }
            }
        }
        results
    }

    /// Returns the warning recorded in the outcome when persistence fails.
    fn persist(&self, session: &str, bundle: &RunBundle) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.save(bundle) {
            Ok(()) => {
                info!(
                    design_id = %bundle.design_id,
                    run_id = %bundle.run_id,
                    "Baseline bundle persisted"
                );
                self.emit_event(
                    session,
                    "bundle_persisted",
                    json!({ "design_id": bundle.design_id }),
                );
                None
            }
            Err(err) => {
                warn!(
                    design_id = %bundle.design_id,
                    run_id = %bundle.run_id,
                    error = %err,
                    "Failed to persist baseline bundle"
                );
                self.emit_event(
                    session,
                    "bundle_persist_failed",
                    json!({ "design_id": bundle.design_id, "error": err.to_string() }),
                );
                Some(err.to_string())
            }
        }
    }

    fn failure(
        &self,
        design: &DesignSpecification,
        options: &RunOptions,
        run_id: RunId,
        error: PipelineError,
        state: RunProgress,
        started: Instant,
    ) -> PipelineOutcome {
        let failed_roles = {
            let mut roles = error.failed_roles();
            for panel in state.panels.iter().filter(|p| !p.is_succeeded()) {
                if !roles.contains(&panel.role) {
                    roles.push(panel.role.clone());
                }
            }
            roles
        };
        let scores: BTreeMap<PanelRole, f32> = state
            .records
            .iter()
            .map(|record| (record.role.clone(), record.match_score))
            .collect();

        let partial_panels: Vec<PanelResult> = state
            .panels
            .iter()
            .filter(|panel| panel.is_succeeded() && !failed_roles.contains(&panel.role))
            .cloned()
            .collect();
        let partial_bundle = (!partial_panels.is_empty())
            .then(|| self.partial_bundle(design, options, &run_id, partial_panels, &state, started))
            .flatten();

        error!(
            run_id = %run_id,
            design_id = %design.design_id,
            error = %error,
            failed_roles = ?failed_roles,
            "Pipeline run failed"
        );
        self.emit_event(
            run_id.as_str(),
            "run_failed",
            json!({
                "error": error.to_string(),
                "failed_roles": failed_roles,
                "scores": scores,
            }),
        );

        PipelineOutcome::Failed(RunFailure {
            run_id,
            error,
            failed_roles,
            scores,
            panels: state.panels,
            partial_bundle,
        })
    }

    fn partial_bundle(
        &self,
        design: &DesignSpecification,
        options: &RunOptions,
        run_id: &RunId,
        panels: Vec<PanelResult>,
        state: &RunProgress,
        started: Instant,
    ) -> Option<RunBundle> {
        let seeds = SeedPlan::new(design, options.explicit_seed).ok()?;
        let statistics = RunStatistics {
            total_jobs: state.required_roles.len(),
            generated: panels.iter().filter(|p| !p.role.is_data_role()).count(),
            bypassed: panels.iter().filter(|p| p.role.is_data_role()).count(),
            generation_attempts: panels.iter().map(|p| p.retry_count + 1).sum(),
            duration_ms: started.elapsed().as_millis() as u64,
            ..RunStatistics::default()
        };
        let mut bundle = build_bundle(
            design,
            run_id,
            &seeds,
            &state.required_roles,
            panels,
            state.fingerprint.as_deref().cloned(),
            options.fingerprint_enabled,
            statistics,
        )
        .ok()?;
        bundle.consistency.records = state.records.clone();
        Some(bundle)
    }

    fn emit_event(&self, session_id: &str, event_type: &str, data: serde_json::Value) {
        if let Some(progress) = &self.progress {
            progress.emit_event_best_effort(session_id, event_type, data);
        }
    }
}

/// `required_roles` is the planner's role sequence; panels missing from it make
/// the bundle fail validation.
#[allow(clippy::too_many_arguments)]
fn build_bundle(
    design: &DesignSpecification,
    run_id: &RunId,
    seeds: &SeedPlan,
    required_roles: &[PanelRole],
    panels: Vec<PanelResult>,
    fingerprint: Option<DesignFingerprint>,
    fingerprint_enabled: bool,
    statistics: RunStatistics,
) -> Result<RunBundle, PipelineError> {
    Ok(RunBundle {
        design_id: design.design_id.clone(),
        run_id: run_id.clone(),
        seeds: panels
            .iter()
            .map(|panel| (panel.role.clone(), panel.seed))
            .collect(),
        required_roles: required_roles.to_vec(),
        panels,
        fingerprint,
        fingerprint_enabled,
        composition: None,
        consistency: ConsistencyMetadata::default(),
        metadata: RunMetadata {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            design_hash: design.content_hash()?,
            plan_hash: String::new(),
            base_seed: seeds.base_seed(),
            explicit_seed: seeds.is_explicit(),
            statistics,
        },
    })
}
