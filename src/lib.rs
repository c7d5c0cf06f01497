//! archsheet: Consistency-Gated Presentation Sheet Generation
//!
//! Generates the panels of an architectural presentation sheet from one design
//! specification. An anchor panel is generated first and fingerprinted; every
//! other panel is conditioned on that fingerprint, scored against it and
//! regenerated with rising strictness until it conforms. Calls to the
//! rate-limited generation service are serialised through an adaptive pacing
//! queue, and the final artifact set of a successful run is persisted as an
//! immutable baseline bundle.

pub mod cli;
pub mod config;
pub mod design;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod seed;
pub mod store;
pub mod types;

pub use design::DesignSpecification;
pub use error::{PipelineError, ServiceError, StorageError};
pub use pipeline::{Pipeline, PipelineOutcome, PipelineServices, PipelineSettings, RunOptions};
pub use types::{ArtifactRef, PanelRole, RunId, Seed};
