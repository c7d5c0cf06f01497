//! Design specification: the immutable description of the building being depicted.
//!
//! The pipeline only reads it. Its canonical serialization feeds seed derivation,
//! so two specifications that differ only in key order or Unicode composition
//! hash identically.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

/// Overall building envelope, in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
    #[serde(default = "default_storeys")]
    pub storeys: u32,
}

fn default_storeys() -> u32 {
    1
}

/// One programme space (room or zone) with its target area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSpace {
    pub name: String,
    pub area_m2: f64,
}

/// Site constraints used by the planner for site and elevation panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SiteContext {
    /// Degrees from the plan Y-axis to north.
    #[serde(default)]
    pub north_direction_deg: f64,
    #[serde(default)]
    pub climate: Option<String>,
    #[serde(default)]
    pub surroundings: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpecification {
    pub design_id: String,
    #[serde(default)]
    pub name: String,
    pub dimensions: Dimensions,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub program: Vec<ProgramSpace>,
    #[serde(default)]
    pub site: SiteContext,
    /// Free-form attributes (roof form, glazing ratio, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl DesignSpecification {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.design_id.trim().is_empty() {
            return Err(PipelineError::Planning(
                "Design id cannot be empty".to_string(),
            ));
        }
        let d = &self.dimensions;
        if !(d.length_m > 0.0 && d.width_m > 0.0 && d.height_m > 0.0) {
            return Err(PipelineError::Planning(format!(
                "Design {} has non-positive dimensions ({} x {} x {})",
                self.design_id, d.length_m, d.width_m, d.height_m
            )));
        }
        if d.storeys == 0 {
            return Err(PipelineError::Planning(format!(
                "Design {} must have at least one storey",
                self.design_id
            )));
        }
        Ok(())
    }

    /// Canonical JSON bytes: sorted keys, NFC-normalized and trimmed strings.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let value = serde_json::to_value(self).map_err(|e| {
            PipelineError::Planning(format!("Failed to serialize design specification: {}", e))
        })?;
        let canonical = canonicalize(value);
        serde_json::to_vec(&canonical).map_err(|e| {
            PipelineError::Planning(format!("Failed to encode canonical design: {}", e))
        })
    }

    /// Hex blake3 digest of the canonical form; recorded in bundles.
    pub fn content_hash(&self) -> Result<String, PipelineError> {
        Ok(blake3::hash(&self.canonical_bytes()?).to_hex().to_string())
    }

    pub fn total_program_area(&self) -> f64 {
        self.program.iter().map(|space| space.area_m2).sum()
    }

    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::Planning(format!(
                "Failed to read design specification {}: {}",
                path.display(),
                e
            ))
        })?;
        let design: DesignSpecification = serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::Planning(format!(
                "Invalid design specification {}: {}",
                path.display(),
                e
            ))
        })?;
        design.validate()?;
        Ok(design)
    }
}

// serde_json's Map is a BTreeMap without `preserve_order`, so keys come out sorted.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().nfc().collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.nfc().collect::<String>(), canonicalize(v)))
                .collect(),
        ),
        other => other,
    }
}
