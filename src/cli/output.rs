//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::PipelineError;

/// Map pipeline errors to a string for CLI output.
pub fn map_error(e: &PipelineError) -> String {
    match e {
        PipelineError::ConsistencyFailure { .. } => format!("consistency: {}", e),
        PipelineError::ConfigError(_) => format!("config: {}", e),
        PipelineError::Persistence(_) => format!("store: {}", e),
        _ => e.to_string(),
    }
}

/// Exit code per error family.
pub fn exit_code(e: &PipelineError) -> i32 {
    match e {
        PipelineError::ConfigError(_) | PipelineError::Planning(_) => 2,
        PipelineError::ConsistencyFailure { .. } => 3,
        _ => 1,
    }
}
