//! Prompt composition contract.
//!
//! Rich templating lives outside this crate; the default composer produces plain,
//! deterministic prompts from the design and, for dependent panels, the fingerprint.

use crate::design::DesignSpecification;
use crate::provider::DesignFingerprint;
use crate::types::PanelRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub prompt: String,
    pub negative_prompt: String,
}

pub trait PromptComposer: Send + Sync {
    /// Prompt for `role`. `fingerprint` is `None` only for the anchor.
    fn compose(
        &self,
        role: &PanelRole,
        design: &DesignSpecification,
        fingerprint: Option<&DesignFingerprint>,
    ) -> PromptPair;

    /// Tightened prompt for strict retry `level` (1-based).
    fn tighten(&self, prompt: &PromptPair, fingerprint: &DesignFingerprint, level: u32) -> PromptPair;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultPromptComposer;

impl DefaultPromptComposer {
    const BASE_NEGATIVE: &'static str =
        "blurry, distorted geometry, text artifacts, watermark, inconsistent materials";

    fn view_phrase(role: &PanelRole) -> String {
        match role.as_str() {
            "hero_3d" => "three-quarter aerial perspective render".to_string(),
            "site_plan" => "orthographic site plan, top-down".to_string(),
            "floor_plan_ground" => "ground floor plan, orthographic".to_string(),
            "floor_plan_upper" => "upper floor plan, orthographic".to_string(),
            "axonometric" => "exploded axonometric drawing".to_string(),
            "interior" => "interior perspective render".to_string(),
            "material_palette" => "material palette swatches".to_string(),
            other => other.replace('_', " "),
        }
    }
}

impl PromptComposer for DefaultPromptComposer {
    fn compose(
        &self,
        role: &PanelRole,
        design: &DesignSpecification,
        fingerprint: Option<&DesignFingerprint>,
    ) -> PromptPair {
        let d = &design.dimensions;
        let mut prompt = format!(
            "{} of a {} storey {} building, {:.1}m x {:.1}m x {:.1}m",
            Self::view_phrase(role),
            d.storeys,
            if design.style.is_empty() {
                "contemporary"
            } else {
                design.style.as_str()
            },
            d.length_m,
            d.width_m,
            d.height_m
        );
        if !design.materials.is_empty() {
            prompt.push_str(&format!(", materials: {}", design.materials.join(", ")));
        }
        if let Some(fp) = fingerprint {
            prompt.push_str(&format!(
                "; match reference massing: {}; roof: {}; style: {}",
                fp.massing_descriptor, fp.roof_descriptor, fp.style_descriptor
            ));
        }
        PromptPair {
            prompt,
            negative_prompt: Self::BASE_NEGATIVE.to_string(),
        }
    }

    fn tighten(&self, prompt: &PromptPair, fingerprint: &DesignFingerprint, level: u32) -> PromptPair {
        let emphasis = "(".repeat(level.min(3) as usize);
        let closing = ")".repeat(level.min(3) as usize);
        PromptPair {
            prompt: format!(
                "{}; {}identical massing {} and roof {}{}",
                prompt.prompt,
                emphasis,
                fingerprint.massing_descriptor,
                fingerprint.roof_descriptor,
                closing
            ),
            negative_prompt: format!(
                "{}, different building, altered roof form, changed proportions",
                prompt.negative_prompt
            ),
        }
    }
}
