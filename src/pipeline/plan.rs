//! Job planning: design specification -> ordered generation jobs.
//!
//! Planning is two-phase. [`JobPlanner::plan`] fixes the role order, the seeds and
//! the anchor job. Dependent jobs are only built by [`JobPlanner::build_dependents`]
//! once the anchor's fingerprint exists, so they are never patched afterwards.

use crate::design::DesignSpecification;
use crate::error::PipelineError;
use crate::provider::{DesignFingerprint, GenerationRequest, PromptComposer};
use crate::seed::SeedPlan;
use crate::types::{ArtifactRef, PanelRole, Seed};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PANEL_WIDTH: u32 = 1024;
pub const DEFAULT_PANEL_HEIGHT: u32 = 768;

/// One unit of generation work for a single role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub role: PanelRole,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: Seed,
    pub width: u32,
    pub height: u32,
    pub depends_on_fingerprint: bool,
    pub style_reference: Option<ArtifactRef>,
    pub reference_strength: Option<f32>,
    /// Rendered by the panel formatter instead of the generation service.
    pub bypass: bool,
}

impl GenerationJob {
    pub fn to_request(&self) -> GenerationRequest {
        GenerationRequest {
            role: self.role.clone(),
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            seed: self.seed,
            reference_artifact: self.style_reference.clone(),
            reference_strength: self.reference_strength,
        }
    }
}

/// Caller-controlled planning inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOptions {
    /// Role order; `None` uses [`PanelRole::default_sequence`].
    pub roles: Option<Vec<PanelRole>>,
    pub explicit_seed: Option<Seed>,
    pub width: u32,
    pub height: u32,
    /// Extra constraints appended to the site plan prompt.
    pub site_constraints: Option<String>,
    pub fingerprint_enabled: bool,
    /// Reference strength for dependent jobs conditioned on the anchor.
    pub reference_strength: f32,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            roles: None,
            explicit_seed: None,
            width: DEFAULT_PANEL_WIDTH,
            height: DEFAULT_PANEL_HEIGHT,
            site_constraints: None,
            fingerprint_enabled: true,
            reference_strength: 0.55,
        }
    }
}

/// Adjustment made to a caller-supplied role sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanCorrection {
    AnchorInserted,
    AnchorMoved { from_index: usize },
    DuplicateDropped { role: PanelRole },
}

/// Phase-one plan: role order, seeds and the anchor job.
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    pub design_id: String,
    pub roles: Vec<PanelRole>,
    pub seeds: SeedPlan,
    pub anchor: GenerationJob,
    pub corrections: Vec<PlanCorrection>,
    pub options: PlanOptions,
}

impl GenerationPlan {
    pub fn dependent_roles(&self) -> impl Iterator<Item = &PanelRole> {
        self.roles.iter().filter(|role| !role.is_anchor())
    }

    pub fn seed_for(&self, role: &PanelRole) -> Seed {
        self.seeds.seed_for(role)
    }
}

/// Anchor first, duplicates removed. Pure; the planner logs the corrections.
pub fn normalize_roles(requested: &[PanelRole]) -> (Vec<PanelRole>, Vec<PlanCorrection>) {
    let mut corrections = Vec::new();
    let mut seen = HashSet::new();
    let mut roles = Vec::with_capacity(requested.len() + 1);

    for role in requested {
        if seen.insert(role.clone()) {
            roles.push(role.clone());
        } else {
            corrections.push(PlanCorrection::DuplicateDropped { role: role.clone() });
        }
    }

    match roles.iter().position(PanelRole::is_anchor) {
        Some(0) => {}
        Some(index) => {
            let anchor = roles.remove(index);
            roles.insert(0, anchor);
            corrections.insert(0, PlanCorrection::AnchorMoved { from_index: index });
        }
        None => {
            roles.insert(0, PanelRole::HERO_3D);
            corrections.insert(0, PlanCorrection::AnchorInserted);
        }
    }

    (roles, corrections)
}

pub struct JobPlanner {
    composer: Arc<dyn PromptComposer>,
}

impl JobPlanner {
    pub fn new(composer: Arc<dyn PromptComposer>) -> Self {
        Self { composer }
    }

    /// Phase one. Validates the design and the role names, resolves seeds and
    /// builds the anchor job.
    pub fn plan(
        &self,
        design: &DesignSpecification,
        options: PlanOptions,
    ) -> Result<GenerationPlan, PipelineError> {
        design.validate()?;
        if options.width == 0 || options.height == 0 {
            return Err(PipelineError::Planning(format!(
                "panel dimensions must be non-zero, got {}x{}",
                options.width, options.height
            )));
        }

        let requested = options
            .roles
            .clone()
            .unwrap_or_else(PanelRole::default_sequence);
        if let Some(bad) = requested.iter().find(|role| !role.is_valid()) {
            return Err(PipelineError::Planning(format!(
                "invalid panel role name: '{}'",
                bad
            )));
        }

        let (roles, corrections) = normalize_roles(&requested);
        for correction in &corrections {
            warn!(design_id = %design.design_id, correction = ?correction, "Role sequence corrected");
        }

        let seeds = SeedPlan::new(design, options.explicit_seed)?;
        let anchor = self.build_job(design, &PanelRole::HERO_3D, &seeds, &options, None);
        debug!(
            design_id = %design.design_id,
            roles = roles.len(),
            base_seed = seeds.base_seed(),
            "Plan constructed"
        );

        Ok(GenerationPlan {
            design_id: design.design_id.clone(),
            roles,
            seeds,
            anchor,
            corrections,
            options,
        })
    }

    /// Phase two. Builds every non-anchor job, conditioned on `fingerprint`
    /// when fingerprinting is enabled.
    pub fn build_dependents(
        &self,
        plan: &GenerationPlan,
        design: &DesignSpecification,
        fingerprint: Option<&DesignFingerprint>,
    ) -> Vec<GenerationJob> {
        plan.dependent_roles()
            .map(|role| self.build_job(design, role, &plan.seeds, &plan.options, fingerprint))
            .collect()
    }

    fn build_job(
        &self,
        design: &DesignSpecification,
        role: &PanelRole,
        seeds: &SeedPlan,
        options: &PlanOptions,
        fingerprint: Option<&DesignFingerprint>,
    ) -> GenerationJob {
        let bypass = role.is_data_role();
        let conditioned = !role.is_anchor() && !bypass && fingerprint.is_some();
        let mut pair = self
            .composer
            .compose(role, design, if conditioned { fingerprint } else { None });
        if *role == PanelRole::SITE_PLAN {
            if let Some(constraints) = &options.site_constraints {
                pair.prompt.push_str(&format!("; site constraints: {}", constraints));
            }
        }

        GenerationJob {
            id: format!("{}:{}", design.design_id, role),
            role: role.clone(),
            prompt: pair.prompt,
            negative_prompt: pair.negative_prompt,
            seed: seeds.seed_for(role),
            width: options.width,
            height: options.height,
            depends_on_fingerprint: conditioned,
            style_reference: fingerprint
                .filter(|_| conditioned)
                .map(|fp| fp.source_artifact_ref.clone()),
            reference_strength: conditioned.then_some(options.reference_strength),
            bypass,
        }
    }
}
