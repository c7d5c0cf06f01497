//! Integration tests for the archsheet pipeline

mod baseline_store;
mod config_integration;
mod pacing_queue;
mod pipeline_run;
mod test_utils;
