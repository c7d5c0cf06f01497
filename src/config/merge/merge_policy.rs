//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Struct-level serde defaults cover every other key; only values that later
/// layers commonly override partially are seeded here.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("store.path", ".archsheet/baselines")?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")
}
