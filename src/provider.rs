//! External collaborator contracts
//!
//! The pipeline never talks to image models, scorers or layout engines directly. It
//! consumes them through the traits in this module so deployments can plug in HTTP
//! services (see [`http`]) and tests can plug in scripted doubles.

use crate::design::DesignSpecification;
use crate::error::ServiceError;
use crate::types::{ArtifactRef, PanelRole, Seed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod prompt;

pub use prompt::{DefaultPromptComposer, PromptComposer, PromptPair};

/// Request to the image generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub role: PanelRole,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: Seed,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_artifact: Option<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_strength: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub artifact_ref: ArtifactRef,
    pub seed_used: Seed,
}

/// Compact descriptor of the anchor artifact. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignFingerprint {
    pub massing_descriptor: String,
    pub roof_descriptor: String,
    pub style_descriptor: String,
    pub source_artifact_ref: ArtifactRef,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub score: f32,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionPanel {
    pub role: PanelRole,
    pub artifact_ref: ArtifactRef,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionRequest {
    pub panels: Vec<CompositionPanel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<ArtifactRef>,
}

/// Placement of one panel on the composed sheet, in sheet pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelCoordinates {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SheetDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionResult {
    pub composed_artifact_ref: ArtifactRef,
    pub coordinates_by_role: BTreeMap<PanelRole, PanelCoordinates>,
    pub dimensions: SheetDimensions,
}

/// Outcome of one independent geometry/structure check on a panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorResult {
    pub role: PanelRole,
    pub validator: String,
    pub passed: bool,
    /// Optional normalised score in [0, 1].
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Image generation service. The only caller is the pacing queue worker.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, ServiceError>;

    fn service_name(&self) -> &str;
}

#[async_trait]
pub trait SimilarityService: Send + Sync {
    async fn score(
        &self,
        candidate: &ArtifactRef,
        fingerprint: &DesignFingerprint,
    ) -> Result<SimilarityScore, ServiceError>;
}

#[async_trait]
pub trait FingerprintService: Send + Sync {
    async fn extract(
        &self,
        anchor: &ArtifactRef,
        design: &DesignSpecification,
    ) -> Result<DesignFingerprint, ServiceError>;
}

#[async_trait]
pub trait CompositionService: Send + Sync {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionResult, ServiceError>;
}

/// Deterministic renderer for tabular roles that bypass generation.
#[async_trait]
pub trait PanelFormatter: Send + Sync {
    async fn render(
        &self,
        role: &PanelRole,
        design: &DesignSpecification,
    ) -> Result<ArtifactRef, ServiceError>;
}

/// Geometry/structure checks independent of the fingerprint.
#[async_trait]
pub trait PanelValidator: Send + Sync {
    async fn validate(
        &self,
        role: &PanelRole,
        artifact: &ArtifactRef,
        design: &DesignSpecification,
    ) -> Result<Vec<ValidatorResult>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_request_omits_absent_reference() {
        let request = GenerationRequest {
            role: PanelRole::HERO_3D,
            prompt: "p".to_string(),
            negative_prompt: "n".to_string(),
            width: 1024,
            height: 768,
            seed: 7,
            reference_artifact: None,
            reference_strength: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("reference_artifact").is_none());
        assert_eq!(value["seed"], 7);
    }

    #[test]
    fn composition_result_keys_by_role_name() {
        let mut coordinates = BTreeMap::new();
        coordinates.insert(
            PanelRole::HERO_3D,
            PanelCoordinates {
                x: 0,
                y: 0,
                width: 100,
                height: 80,
            },
        );
        let result = CompositionResult {
            composed_artifact_ref: ArtifactRef::new("sheet.png"),
            coordinates_by_role: coordinates,
            dimensions: SheetDimensions {
                width: 841,
                height: 594,
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["coordinates_by_role"]["hero_3d"]["width"], 100);
    }
}
