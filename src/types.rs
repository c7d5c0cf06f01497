//! Shared identifiers for the panel generation pipeline.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Generation seed. Values stay inside the unsigned 32-bit range.
pub type Seed = u64;

/// Mask applied to every derived seed.
pub const SEED_MASK: u64 = 0xFFFF_FFFF;

/// Panel role within one run (e.g. `hero_3d`, `elevation_north`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelRole(Cow<'static, str>);

impl PanelRole {
    /// The anchor: single 3-D hero view used as the style reference.
    pub const HERO_3D: PanelRole = PanelRole::from_static("hero_3d");
    pub const SITE_PLAN: PanelRole = PanelRole::from_static("site_plan");
    pub const FLOOR_PLAN_GROUND: PanelRole = PanelRole::from_static("floor_plan_ground");
    pub const FLOOR_PLAN_UPPER: PanelRole = PanelRole::from_static("floor_plan_upper");
    pub const ELEVATION_NORTH: PanelRole = PanelRole::from_static("elevation_north");
    pub const ELEVATION_SOUTH: PanelRole = PanelRole::from_static("elevation_south");
    pub const ELEVATION_EAST: PanelRole = PanelRole::from_static("elevation_east");
    pub const ELEVATION_WEST: PanelRole = PanelRole::from_static("elevation_west");
    pub const SECTION_A: PanelRole = PanelRole::from_static("section_a");
    pub const SECTION_B: PanelRole = PanelRole::from_static("section_b");
    pub const AXONOMETRIC: PanelRole = PanelRole::from_static("axonometric");
    pub const INTERIOR: PanelRole = PanelRole::from_static("interior");
    pub const MATERIAL_PALETTE: PanelRole = PanelRole::from_static("material_palette");
    pub const PROJECT_DATA: PanelRole = PanelRole::from_static("project_data");
    pub const SCHEDULES: PanelRole = PanelRole::from_static("schedules");

    pub const fn from_static(name: &'static str) -> Self {
        PanelRole(Cow::Borrowed(name))
    }

    /// Build a role from a user-supplied name. Names are lowercased and trimmed.
    pub fn new(name: impl AsRef<str>) -> Self {
        PanelRole(Cow::Owned(name.as_ref().trim().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anchor(&self) -> bool {
        *self == Self::HERO_3D
    }

    /// Tabular roles rendered by a formatter instead of the generation service.
    pub fn is_data_role(&self) -> bool {
        *self == Self::PROJECT_DATA || *self == Self::SCHEDULES
    }

    /// Role names are non-empty and limited to `[a-z0-9_]`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    /// Default ordering used when the caller supplies no sequence.
    pub fn default_sequence() -> Vec<PanelRole> {
        vec![
            Self::HERO_3D,
            Self::SITE_PLAN,
            Self::FLOOR_PLAN_GROUND,
            Self::FLOOR_PLAN_UPPER,
            Self::ELEVATION_NORTH,
            Self::ELEVATION_SOUTH,
            Self::ELEVATION_EAST,
            Self::ELEVATION_WEST,
            Self::SECTION_A,
            Self::SECTION_B,
            Self::AXONOMETRIC,
            Self::INTERIOR,
            Self::MATERIAL_PALETTE,
            Self::PROJECT_DATA,
            Self::SCHEDULES,
        ]
    }
}

impl fmt::Display for PanelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PanelRole {
    fn from(value: &str) -> Self {
        PanelRole::new(value)
    }
}

/// Opaque reference to an artifact held by an external service (URL, blob key, path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        ArtifactRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// `run-{millis}-{counter}`; sortable by creation time within one process.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let millis = chrono::Utc::now().timestamp_millis();
        RunId(format!(
            "run-{}-{:04}",
            millis,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
