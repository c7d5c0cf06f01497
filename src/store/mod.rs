//! Baseline Store
//!
//! Persists the final artifact set of a successful run as one immutable bundle.
//! Bundles are keyed by design id; a later run of the same design supersedes the
//! previous one as the design's latest baseline while the history is kept.

pub mod persistence;

pub use persistence::SledBaselineStore;

use crate::error::StorageError;
use crate::pipeline::drift::DriftReport;
use crate::pipeline::executor::PanelResult;
use crate::pipeline::gate::ConsistencyRecord;
use crate::provider::{CompositionResult, DesignFingerprint};
use crate::types::{PanelRole, RunId, Seed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters describing how a run went.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_jobs: usize,
    pub generated: usize,
    pub bypassed: usize,
    pub regenerations: usize,
    pub gate_rounds: u32,
    pub generation_attempts: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub crate_version: String,
    pub created_at: DateTime<Utc>,
    /// blake3 of the canonical design specification
    pub design_hash: String,
    /// blake3 of the role sequence, seeds, panel size and gate settings
    #[serde(default)]
    pub plan_hash: String,
    pub base_seed: Seed,
    pub explicit_seed: bool,
    pub statistics: RunStatistics,
}

/// Gate history and drift verdict recorded with the bundle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsistencyMetadata {
    pub gate_passed: bool,
    pub rounds: u32,
    pub records: Vec<ConsistencyRecord>,
    pub drift: Option<DriftReport>,
}

/// Everything a run produced. Never mutated after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBundle {
    pub design_id: String,
    pub run_id: RunId,
    pub panels: Vec<PanelResult>,
    pub fingerprint: Option<DesignFingerprint>,
    /// Whether the run extracted a fingerprint; bundles of such runs must carry it.
    pub fingerprint_enabled: bool,
    pub seeds: BTreeMap<PanelRole, Seed>,
    pub required_roles: Vec<PanelRole>,
    pub composition: Option<CompositionResult>,
    pub consistency: ConsistencyMetadata,
    pub metadata: RunMetadata,
}

impl RunBundle {
    pub fn panel(&self, role: &PanelRole) -> Option<&PanelResult> {
        self.panels.iter().find(|panel| &panel.role == role)
    }

    /// Bundles must be complete before they are persisted.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.fingerprint_enabled && self.fingerprint.is_none() {
            return Err(StorageError::MissingFingerprint);
        }
        for role in &self.required_roles {
            let panel = self
                .panel(role)
                .ok_or_else(|| StorageError::MissingRole(role.clone()))?;
            if !panel.is_succeeded() {
                return Err(StorageError::FailedPanel(role.clone()));
            }
            if !self.seeds.contains_key(role) {
                return Err(StorageError::MissingSeed(role.clone()));
            }
        }
        Ok(())
    }
}

/// Baseline persistence contract
pub trait BaselineStore: Send + Sync {
    /// Validate and persist `bundle` atomically as the design's latest baseline.
    fn save(&self, bundle: &RunBundle) -> Result<(), StorageError>;

    fn load_latest(&self, design_id: &str) -> Result<Option<RunBundle>, StorageError>;

    fn load(&self, design_id: &str, run_id: &RunId) -> Result<Option<RunBundle>, StorageError>;

    /// Run ids persisted for `design_id`, oldest first.
    fn list_runs(&self, design_id: &str) -> Result<Vec<RunId>, StorageError>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::bundle;
    use super::*;
    use crate::pipeline::executor::PanelStatus;

    #[test]
    fn complete_bundle_validates() {
        assert!(bundle("run-1").validate().is_ok());
    }

    #[test]
    fn missing_role_is_rejected() {
        let mut b = bundle("run-1");
        b.panels.retain(|p| p.role != PanelRole::ELEVATION_NORTH);
        assert!(matches!(
            b.validate(),
            Err(StorageError::MissingRole(role)) if role == PanelRole::ELEVATION_NORTH
        ));
    }

    #[test]
    fn missing_seed_is_rejected() {
        let mut b = bundle("run-1");
        b.seeds.remove(&PanelRole::HERO_3D);
        assert!(matches!(b.validate(), Err(StorageError::MissingSeed(_))));
    }

    #[test]
    fn failed_panel_is_rejected() {
        let mut b = bundle("run-1");
        b.panels[1].status = PanelStatus::Failed;
        assert!(matches!(b.validate(), Err(StorageError::FailedPanel(_))));
    }

    #[test]
    fn missing_fingerprint_is_rejected_only_when_enabled() {
        let mut b = bundle("run-1");
        b.fingerprint = None;
        assert!(matches!(b.validate(), Err(StorageError::MissingFingerprint)));
        b.fingerprint_enabled = false;
        assert!(b.validate().is_ok());
    }
}
