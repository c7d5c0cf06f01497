//! Drift aggregation: one report from gate scores and independent validator checks.

use crate::pipeline::gate::ConsistencyRecord;
use crate::provider::ValidatorResult;
use crate::types::PanelRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub fingerprint_weight: f32,
    pub validator_weight: f32,
    pub min_overall_score: f32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            fingerprint_weight: 0.7,
            validator_weight: 0.3,
            min_overall_score: 0.75,
        }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.fingerprint_weight < 0.0 || self.validator_weight < 0.0 {
            return Err("drift weights must not be negative".to_string());
        }
        if self.fingerprint_weight + self.validator_weight <= 0.0 {
            return Err("drift weights must not both be zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_overall_score) {
            return Err(format!(
                "drift.min_overall_score must be within [0, 1], got {}",
                self.min_overall_score
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDrift {
    pub final_score: Option<f32>,
    pub best_score: Option<f32>,
    pub attempts: u32,
    pub passed: bool,
    pub validator_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriftSummary {
    pub total: usize,
    pub checked: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub avg_score: Option<f32>,
    pub min_score: Option<f32>,
    pub max_score: Option<f32>,
    pub failed_roles: Vec<PanelRole>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub overall_score: f32,
    pub passed: bool,
    pub per_role: BTreeMap<PanelRole, RoleDrift>,
    pub summary: DriftSummary,
}

/// Combine the record history with validator results for `roles`.
///
/// The final score of a role is its record from the latest round. Roles without
/// scores or validator results count as skipped. With no inputs at all the
/// overall score is 1.0.
pub fn aggregate(
    roles: &[PanelRole],
    records: &[ConsistencyRecord],
    pass_threshold: f32,
    validators: &[ValidatorResult],
    config: &DriftConfig,
) -> DriftReport {
    let mut per_role = BTreeMap::new();
    let mut summary = DriftSummary {
        total: roles.len(),
        ..DriftSummary::default()
    };
    let mut final_scores = Vec::new();

    for role in roles {
        let history: Vec<&ConsistencyRecord> = records.iter().filter(|r| &r.role == role).collect();
        let latest = history.iter().max_by_key(|r| r.attempt);
        let final_score = latest.map(|r| r.match_score);
        let best_score = history
            .iter()
            .map(|r| r.match_score)
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))));
        let checks: Vec<&ValidatorResult> = validators.iter().filter(|v| &v.role == role).collect();
        let validator_failures: Vec<String> = checks
            .iter()
            .filter(|v| !v.passed)
            .map(|v| match &v.message {
                Some(message) => format!("{}: {}", v.validator, message),
                None => v.validator.clone(),
            })
            .collect();

        if final_score.is_none() && checks.is_empty() {
            summary.skipped += 1;
            continue;
        }
        summary.checked += 1;

        let passed = final_score.map_or(true, |s| s >= pass_threshold) && validator_failures.is_empty();
        if passed {
            summary.passed += 1;
        } else {
            summary.failed += 1;
            summary.failed_roles.push(role.clone());
        }
        if let Some(score) = final_score {
            final_scores.push(score);
        }

        per_role.insert(
            role.clone(),
            RoleDrift {
                final_score,
                best_score,
                attempts: latest.map_or(0, |r| r.attempt),
                passed,
                validator_failures,
            },
        );
    }

    if !final_scores.is_empty() {
        let sum: f32 = final_scores.iter().sum();
        summary.avg_score = Some(sum / final_scores.len() as f32);
        summary.min_score = final_scores.iter().copied().reduce(f32::min);
        summary.max_score = final_scores.iter().copied().reduce(f32::max);
    }

    let relevant: Vec<&ValidatorResult> = validators
        .iter()
        .filter(|v| roles.contains(&v.role))
        .collect();
    let validator_fraction = (!relevant.is_empty())
        .then(|| relevant.iter().filter(|v| v.passed).count() as f32 / relevant.len() as f32);

    let mut weighted = 0.0;
    let mut weight = 0.0;
    if let Some(avg) = summary.avg_score {
        weighted += config.fingerprint_weight * avg;
        weight += config.fingerprint_weight;
    }
    if let Some(fraction) = validator_fraction {
        weighted += config.validator_weight * fraction;
        weight += config.validator_weight;
    }
    let overall_score = if weight > 0.0 { weighted / weight } else { 1.0 };

    DriftReport {
        overall_score,
        passed: summary.failed == 0 && overall_score >= config.min_overall_score,
        per_role,
        summary,
    }
}
