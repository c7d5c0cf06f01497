//! Loader entry points over the layered sources.

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::ArchsheetConfig;
use crate::error::PipelineError;
use config::{Environment, File};
use std::path::{Path, PathBuf};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for `workspace_root`.
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace
    /// `config/config.toml`, `config/{ARCHSHEET_ENV}.toml`, environment.
    pub fn load(workspace_root: &Path) -> Result<ArchsheetConfig, PipelineError> {
        Self::load_with_file(workspace_root, None)
    }

    /// Like [`ConfigLoader::load`], with an explicit file layered above the
    /// workspace files and below the environment.
    pub fn load_with_file(
        workspace_root: &Path,
        explicit: Option<&Path>,
    ) -> Result<ArchsheetConfig, PipelineError> {
        let mut builder = merge_policy::builder_with_defaults()?;
        builder = global_file::add_to_builder(builder)?;
        builder = workspace_file::add_to_builder(builder, workspace_root)?;
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(Self::environment());

        let config: ArchsheetConfig = builder.build()?.try_deserialize()?;
        Self::checked(config)
    }

    /// Load from a single file (plus defaults), ignoring every other layer.
    pub fn load_from_file(path: &Path) -> Result<ArchsheetConfig, PipelineError> {
        let config: ArchsheetConfig = merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true))
            .build()?
            .try_deserialize()?;
        Self::checked(config)
    }

    /// Global config file location, if a home directory is known.
    pub fn xdg_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }

    /// `ARCHSHEET__PACING__MIN_INTERVAL_MS=2000` sets `pacing.min_interval_ms`.
    fn environment() -> Environment {
        Environment::with_prefix("ARCHSHEET")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn checked(config: ArchsheetConfig) -> Result<ArchsheetConfig, PipelineError> {
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PipelineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
