//! Deterministic seed derivation.
//!
//! Separately generated panels cohere only if every panel of a design is
//! generated from a reproducible seed. Seeds are derived from a blake3 hash of
//! the design's canonical serialization followed by the role name.

use crate::design::DesignSpecification;
use crate::error::PipelineError;
use crate::types::{PanelRole, Seed, SEED_MASK};

/// Seed for `role` of `design`; pure and stable across runs.
pub fn derive_seed(design: &DesignSpecification, role: &PanelRole) -> Result<Seed, PipelineError> {
    let canonical = design.canonical_bytes()?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&canonical);
    hasher.update(b"\x00role:");
    hasher.update(role.as_str().as_bytes());
    Ok(truncate(hasher.finalize()))
}

/// Seed for `role` when the caller supplied an explicit base seed.
pub fn offset_seed(base: Seed, role: &PanelRole) -> Seed {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&base.to_le_bytes());
    hasher.update(b"\x00role:");
    hasher.update(role.as_str().as_bytes());
    truncate(hasher.finalize())
}

/// Seed incremented by `steps`, wrapping inside the 32-bit range.
pub fn bump_seed(seed: Seed, steps: u64) -> Seed {
    seed.wrapping_add(steps) & SEED_MASK
}

fn truncate(hash: blake3::Hash) -> Seed {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes) & SEED_MASK
}

/// Resolves per-role seeds for one run.
#[derive(Debug, Clone)]
pub struct SeedPlan {
    base_seed: Seed,
    explicit: bool,
    design_bytes: Vec<u8>,
}

impl SeedPlan {
    /// Base seed is `explicit_seed` when given, otherwise the anchor role's derived seed.
    pub fn new(design: &DesignSpecification, explicit_seed: Option<Seed>) -> Result<Self, PipelineError> {
        let design_bytes = design.canonical_bytes()?;
        let (base_seed, explicit) = match explicit_seed {
            Some(seed) => (seed & SEED_MASK, true),
            None => (derive_seed(design, &PanelRole::HERO_3D)?, false),
        };
        Ok(Self {
            base_seed,
            explicit,
            design_bytes,
        })
    }

    pub fn base_seed(&self) -> Seed {
        self.base_seed
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn seed_for(&self, role: &PanelRole) -> Seed {
        if role.is_anchor() {
            return self.base_seed;
        }
        if self.explicit {
            return offset_seed(self.base_seed, role);
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.design_bytes);
        hasher.update(b"\x00role:");
        hasher.update(role.as_str().as_bytes());
        truncate(hasher.finalize())
    }
}
