//! Error types for the panel generation pipeline.

use crate::types::PanelRole;
use std::time::Duration;
use thiserror::Error;

/// Baseline storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Bundle is missing required role: {0}")]
    MissingRole(PanelRole),

    #[error("Bundle is missing a seed for role: {0}")]
    MissingSeed(PanelRole),

    #[error("Bundle is missing the design fingerprint")]
    MissingFingerprint,

    #[error("Bundle contains a panel that did not succeed: {0}")]
    FailedPanel(PanelRole),

    #[error("Bundle not found for design {design_id}")]
    BundleNotFound { design_id: String },

    #[error("Bundle serialization failed: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure classes reported by external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    RateLimited,
    Terminal,
}

/// Errors returned by external services (generation, scoring, fingerprint, composition).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Transient service failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Service request rejected: {message}")]
    Terminal { message: String },
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        ServiceError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        ServiceError::Terminal {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        ServiceError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ServiceError::RateLimited { .. } => FailureClass::RateLimited,
            ServiceError::Transient { .. } => FailureClass::Transient,
            ServiceError::Terminal { .. } => FailureClass::Terminal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after, .. }
            | ServiceError::Transient { retry_after, .. } => *retry_after,
            ServiceError::Terminal { .. } => None,
        }
    }
}

/// Pipeline-level errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Anchor panel {role} failed after {attempts} attempt(s): {message}")]
    AnchorFailure {
        role: PanelRole,
        attempts: usize,
        message: String,
    },

    #[error("Consistency gate aborted; non-conforming panels: {}", format_scores(.failed))]
    ConsistencyFailure { failed: Vec<(PanelRole, f32)> },

    #[error("Generation failed for {role} after {attempts} attempt(s): {message}")]
    GenerationFailed {
        role: PanelRole,
        attempts: usize,
        message: String,
    },

    #[error("Fingerprint extraction failed: {0}")]
    FingerprintFailed(String),

    #[error("Composition failed: {0}")]
    Composition(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    #[error("Pacing queue is full")]
    QueueFull,

    #[error("Pacing queue is not running")]
    QueueStopped,

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
}

impl PipelineError {
    /// Roles named by this error, if any.
    pub fn failed_roles(&self) -> Vec<PanelRole> {
        match self {
            PipelineError::AnchorFailure { role, .. }
            | PipelineError::GenerationFailed { role, .. } => vec![role.clone()],
            PipelineError::ConsistencyFailure { failed } => {
                failed.iter().map(|(role, _)| role.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::ConfigError(err.to_string())
    }
}

fn format_scores(failed: &[(PanelRole, f32)]) -> String {
    failed
        .iter()
        .map(|(role, score)| format!("{}={:.3}", role, score))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_failure_message_lists_scores() {
        let err = PipelineError::ConsistencyFailure {
            failed: vec![(PanelRole::ELEVATION_SOUTH, 0.75)],
        };
        assert_eq!(
            err.to_string(),
            "Consistency gate aborted; non-conforming panels: elevation_south=0.750"
        );
        assert_eq!(err.failed_roles(), vec![PanelRole::ELEVATION_SOUTH]);
    }

    #[test]
    fn service_error_classification() {
        let err = ServiceError::rate_limited("slow down", Some(Duration::from_secs(4)));
        assert_eq!(err.class(), FailureClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
        assert_eq!(ServiceError::terminal("bad").retry_after(), None);
    }
}
