//! Scripted collaborator doubles for unit tests.

use super::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

fn role_of(artifact: &ArtifactRef) -> PanelRole {
    PanelRole::new(artifact.as_str().split('#').next().unwrap_or_default())
}

/// Generation double. Unscripted calls succeed with `"{role}#{n}"`, where `n`
/// counts calls for that role.
#[derive(Default)]
pub struct MockGenerationService {
    script: Mutex<HashMap<PanelRole, VecDeque<ServiceError>>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue failures returned before `role` next succeeds.
    pub fn fail_role(&self, role: PanelRole, errors: Vec<ServiceError>) {
        self.script.lock().entry(role).or_default().extend(errors);
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, role: &PanelRole) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|request| &request.role == role)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, ServiceError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(request.clone());
            calls.iter().filter(|call| call.role == request.role).count()
        };
        if let Some(err) = self
            .script
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
        "mock"
    }
}

/// Similarity double replaying per-role scores; unscripted roles score `default_score`.
pub struct MockSimilarityService {
    scores: Mutex<HashMap<PanelRole, VecDeque<Result<f32, ServiceError>>>>,
    threshold: f32,
    default_score: f32,
    calls: Mutex<Vec<ArtifactRef>>,
}

impl MockSimilarityService {
    pub fn new(threshold: f32) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            threshold,
            default_score: 0.95,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, role: PanelRole, scores: Vec<f32>) {
        self.scores
            .lock()
            .entry(role)
            .or_default()
            .extend(scores.into_iter().map(Ok));
    }

    pub fn script_error(&self, role: PanelRole, error: ServiceError) {
        self.scores.lock().entry(role).or_default().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<ArtifactRef> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SimilarityService for MockSimilarityService {
    async fn score(
        &self,
        candidate: &ArtifactRef,
        _fingerprint: &DesignFingerprint,
    ) -> Result<SimilarityScore, ServiceError> {
        self.calls.lock().push(candidate.clone());
        let scripted = self
            .scores
            .lock()
            .get_mut(&role_of(candidate))
            .and_then(VecDeque::pop_front);
        let score = match scripted {
            Some(result) => result?,
            None => self.default_score,
        };
        Ok(SimilarityScore {
            score,
            passed: score >= self.threshold,
        })
    }
}

#[derive(Default)]
pub struct MockFingerprintService {
    failure: Mutex<Option<ServiceError>>,
}

impl MockFingerprintService {
    pub fn failing(error: ServiceError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
        }
    }
}

#[async_trait]
impl FingerprintService for MockFingerprintService {
    async fn extract(
        &self,
        anchor: &ArtifactRef,
        design: &DesignSpecification,
    ) -> Result<DesignFingerprint, ServiceError> {
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        Ok(DesignFingerprint {
            massing_descriptor: format!("{} storey block", design.dimensions.storeys),
            roof_descriptor: "pitched".to_string(),
            style_descriptor: design.style.clone(),
            source_artifact_ref: anchor.clone(),
            extracted_at: Utc::now(),
        })
    }
}

/// Lays panels out in a fixed four-column grid.
#[derive(Default)]
pub struct MockCompositionService {
    requests: Mutex<Vec<CompositionRequest>>,
}

impl MockCompositionService {
    pub fn requests(&self) -> Vec<CompositionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompositionService for MockCompositionService {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionResult, ServiceError> {
        let coordinates_by_role = request
            .panels
            .iter()
            .enumerate()
            .map(|(i, panel)| {
                (
                    panel.role.clone(),
                    PanelCoordinates {
                        x: (i as u32 % 4) * 256,
                        y: (i as u32 / 4) * 192,
                        width: 256,
                        height: 192,
                    },
                )
            })
            .collect();
        self.requests.lock().push(request);
        Ok(CompositionResult {
            composed_artifact_ref: ArtifactRef::new("sheet#1"),
            coordinates_by_role,
            dimensions: SheetDimensions {
                width: 1024,
                height: 768,
            },
        })
    }
}

#[derive(Default)]
pub struct MockFormatter;

#[async_trait]
impl PanelFormatter for MockFormatter {
    async fn render(
        &self,
        role: &PanelRole,
        _design: &DesignSpecification,
    ) -> Result<ArtifactRef, ServiceError> {
        Ok(ArtifactRef::new(format!("{}#table", role)))
    }
}

/// Fails the named roles, passes everything else.
#[derive(Default)]
pub struct MockValidator {
    failing: Vec<PanelRole>,
}

impl MockValidator {
    pub fn failing(roles: Vec<PanelRole>) -> Self {
        Self { failing: roles }
    }
}

#[async_trait]
impl PanelValidator for MockValidator {
    async fn validate(
        &self,
        role: &PanelRole,
        _artifact: &ArtifactRef,
        _design: &DesignSpecification,
    ) -> Result<Vec<ValidatorResult>, ServiceError> {
        let passed = !self.failing.contains(role);
        Ok(vec![ValidatorResult {
            role: role.clone(),
            validator: "outline".to_string(),
            passed,
            score: Some(if passed { 1.0 } else { 0.0 }),
            message: None,
        }])
    }
}
