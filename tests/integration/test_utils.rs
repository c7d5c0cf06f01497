//! Shared test utilities for integration tests
//!
//! Environment isolation for configuration tests and scripted collaborator
//! doubles for pipeline tests.

use archsheet::design::DesignSpecification;
use archsheet::error::ServiceError;
use archsheet::provider::{
    CompositionRequest, CompositionResult, CompositionService, DesignFingerprint,
    FingerprintService, GeneratedArtifact, GenerationRequest, GenerationService, PanelCoordinates,
    PanelFormatter, SheetDimensions, SimilarityScore, SimilarityService,
};
use archsheet::types::{ArtifactRef, PanelRole};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::time::Instant;

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Run `f` with `XDG_CONFIG_HOME` and `HOME` inside `test_dir` and the given
/// extra variables set; everything is restored afterwards.
pub fn with_env<F, R>(test_dir: &TempDir, vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let mut names: Vec<&str> = vec!["HOME", "XDG_CONFIG_HOME"];
    names.extend(vars.iter().map(|(name, _)| *name));
    let saved: Vec<(String, Option<String>)> = names
        .iter()
        .map(|name| (name.to_string(), std::env::var(name).ok()))
        .collect();

    let home = test_dir.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    std::env::set_var("HOME", &home);
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().join("xdg"));
    for (name, value) in vars {
        std::env::set_var(name, value);
    }

    let result = f();

    for (name, value) in saved {
        match value {
            Some(value) => std::env::set_var(&name, value),
            None => std::env::remove_var(&name),
        }
    }
    result
}

pub fn sample_design() -> DesignSpecification {
    serde_json::from_value(serde_json::json!({
        "design_id": "house-001",
        "name": "Courtyard House",
        "dimensions": { "length_m": 18.0, "width_m": 10.5, "height_m": 7.2, "storeys": 2 },
        "materials": ["brick", "timber"],
        "style": "contemporary vernacular",
        "program": [
            { "name": "living", "area_m2": 42.0 },
            { "name": "kitchen", "area_m2": 18.0 }
        ],
        "site": { "north_direction_deg": 12.0, "climate": "temperate" }
    }))
    .unwrap()
}

fn role_of(artifact: &ArtifactRef) -> PanelRole {
    PanelRole::new(artifact.as_str().split('#').next().unwrap_or_default())
}

/// Generation double: scripted failures per role, then `"{role}#{n}"`.
#[derive(Default)]
pub struct ScriptedGeneration {
    failures: SyncMutex<HashMap<PanelRole, VecDeque<ServiceError>>>,
    calls: SyncMutex<Vec<(GenerationRequest, Instant)>>,
}

impl ScriptedGeneration {
    pub fn fail(&self, role: PanelRole, errors: Vec<ServiceError>) {
        self.failures.lock().entry(role).or_default().extend(errors);
    }

    pub fn roles_called(&self) -> Vec<PanelRole> {
        self.calls.lock().iter().map(|(r, _)| r.role.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, t)| *t).collect()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.calls.lock().iter().map(|(r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, ServiceError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push((request.clone(), Instant::now()));
            calls.iter().filter(|(r, _)| r.role == request.role).count()
        };
        if let Some(err) = self
            .failures
            .lock()
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(GeneratedArtifact {
            artifact_ref: ArtifactRef::new(format!("{}#{}", request.role, n)),
            seed_used: request.seed,
        })
    }

    fn service_name(&self) -> &str {
        "scripted"
    }
}

/// Similarity double replaying per-role scores; unscripted roles score 0.95.
#[derive(Default)]
pub struct ScriptedSimilarity {
    scores: SyncMutex<HashMap<PanelRole, VecDeque<f32>>>,
}

impl ScriptedSimilarity {
    pub fn script(&self, role: PanelRole, scores: Vec<f32>) {
        self.scores.lock().entry(role).or_default().extend(scores);
    }
}

#[async_trait]
impl SimilarityService for ScriptedSimilarity {
    async fn score(
        &self,
        candidate: &ArtifactRef,
        _fingerprint: &DesignFingerprint,
    ) -> Result<SimilarityScore, ServiceError> {
        let score = self
            .scores
            .lock()
            .get_mut(&role_of(candidate))
            .and_then(VecDeque::pop_front)
            .unwrap_or(0.95);
        Ok(SimilarityScore {
            score,
            passed: score >= 0.8,
        })
    }
}

pub struct StaticFingerprint;

#[async_trait]
impl FingerprintService for StaticFingerprint {
    async fn extract(
        &self,
        anchor: &ArtifactRef,
        design: &DesignSpecification,
    ) -> Result<DesignFingerprint, ServiceError> {
        Ok(DesignFingerprint {
            massing_descriptor: format!("{} storey bar", design.dimensions.storeys),
            roof_descriptor: "gable".to_string(),
            style_descriptor: design.style.clone(),
            source_artifact_ref: anchor.clone(),
            extracted_at: chrono::Utc::now(),
        })
    }
}

/// Stacks panels vertically; records requests.
#[derive(Default)]
pub struct StackComposer {
    pub requests: SyncMutex<Vec<CompositionRequest>>,
}

#[async_trait]
impl CompositionService for StackComposer {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionResult, ServiceError> {
        let coordinates_by_role = request
            .panels
            .iter()
            .enumerate()
            .map(|(i, panel)| {
                (
                    panel.role.clone(),
                    PanelCoordinates {
                        x: 0,
                        y: i as u32 * 100,
                        width: 100,
                        height: 100,
                    },
                )
            })
            .collect();
        let height = request.panels.len() as u32 * 100;
        self.requests.lock().push(request);
        Ok(CompositionResult {
            composed_artifact_ref: ArtifactRef::new("sheet#1"),
            coordinates_by_role,
            dimensions: SheetDimensions { width: 100, height },
        })
    }
}

pub struct TableFormatter;

#[async_trait]
impl PanelFormatter for TableFormatter {
    async fn render(
        &self,
        role: &PanelRole,
        _design: &DesignSpecification,
    ) -> Result<ArtifactRef, ServiceError> {
        Ok(ArtifactRef::new(format!("{}#table", role)))
    }
}
