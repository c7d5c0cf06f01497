//! CLI domain: parse, route, output, and presentation only.
//! No pipeline orchestration; the route table dispatches to library services.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::{exit_code, map_error};
pub use parse::{BundleCommands, Cli, Commands, ConfigCommands};
pub use presentation::{
    format_bundle_list, format_bundle_text, format_outcome_text, format_plan_table,
};
pub use route::RunContext;
