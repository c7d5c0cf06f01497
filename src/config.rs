//! Configuration System
//!
//! Layered configuration for pacing, retries, the consistency gate, drift
//! weighting, service endpoints, storage and logging. Sources are merged in
//! order: defaults, global file, workspace files, then `ARCHSHEET__*`
//! environment variables.

use crate::logging::LoggingConfig;
use crate::pipeline::{DriftConfig, ExecutorConfig, GateConfig, PacingConfig, PipelineSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchsheetConfig {
    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub drift: DriftConfig,

    /// External collaborator endpoints
    #[serde(default)]
    pub services: ServiceEndpoints,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Base URLs of the HTTP collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoints {
    pub generation_url: String,
    pub similarity_url: String,
    pub fingerprint_url: String,
    pub composition_url: String,
    pub formatter_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Ceiling applied to server `Retry-After` hints
    pub max_retry_after_secs: u64,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            generation_url: "http://127.0.0.1:8700".to_string(),
            similarity_url: "http://127.0.0.1:8701".to_string(),
            fingerprint_url: "http://127.0.0.1:8701".to_string(),
            composition_url: "http://127.0.0.1:8702".to_string(),
            formatter_url: "http://127.0.0.1:8702".to_string(),
            api_key: None,
            request_timeout_secs: 120,
            max_retry_after_secs: 300,
        }
    }
}

impl ServiceEndpoints {
    pub fn validate(&self) -> Result<(), String> {
        let urls = [
            ("generation_url", &self.generation_url),
            ("similarity_url", &self.similarity_url),
            ("fingerprint_url", &self.fingerprint_url),
            ("composition_url", &self.composition_url),
            ("formatter_url", &self.formatter_url),
        ];
        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("{} must be an http(s) URL, got '{}'", name, url));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than zero".to_string());
        }
        if self.max_retry_after_secs == 0 {
            return Err("max_retry_after_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Baseline store location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Relative paths resolve against the workspace root
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".archsheet/baselines"),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Section(&'static str, String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Section(section, msg) => write!(f, "{}: {}", section, msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ArchsheetConfig {
    /// Validate the entire configuration, collecting every error.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let checks = [
            ("pacing", self.pacing.validate()),
            ("executor", self.executor.validate()),
            ("gate", self.gate.validate()),
            ("drift", self.drift.validate()),
            ("services", self.services.validate()),
            ("logging", self.logging.validate()),
            (
                "store",
                if self.store.path.as_os_str().is_empty() {
                    Err("Store path cannot be empty".to_string())
                } else {
                    Ok(())
                },
            ),
        ];

        let errors: Vec<ValidationError> = checks
            .into_iter()
            .filter_map(|(section, result)| result.err().map(|e| ValidationError::Section(section, e)))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Store path resolved against `workspace_root`.
    pub fn store_path(&self, workspace_root: &std::path::Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            workspace_root.join(&self.store.path)
        }
    }
}

impl From<&ArchsheetConfig> for PipelineSettings {
    fn from(config: &ArchsheetConfig) -> Self {
        Self {
            executor: config.executor.clone(),
            gate: config.gate.clone(),
            drift: config.drift.clone(),
        }
    }
}
